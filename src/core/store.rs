//! The configuration value store.

use crate::core::template::{ConfigTemplate, PropertyDescriptor};
use crate::core::value::TypedValue;
use crate::error::Result;
use crate::notify::{Event, SubscriberRegistry, SubscriptionHandle};
use arc_swap::ArcSwap;
use parking_lot::ReentrantMutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Qualified property id to raw string value.
pub type RawValueMap = BTreeMap<String, String>;

/// Qualified property id to typed value.
pub type TypedValueMap = BTreeMap<String, TypedValue>;

/// The changes produced by one update, keyed by qualified property id.
pub type ChangeSet = BTreeMap<String, ChangeRecord>;

/// The before and after value of one changed property.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Value before the update
    pub old_value: TypedValue,
    /// Value after the update
    pub new_value: TypedValue,
}

/// Kinds of events published by a [`ConfigStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
    /// One or more property values changed.
    ConfigUpdate,
}

/// Published after an update changed at least one property.
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    /// Every property that changed
    pub changes: ChangeSet,
    /// Store version after the update
    pub version: u64,
}

impl Event for ConfigUpdate {
    type Kind = StoreEventKind;

    fn kind(&self) -> StoreEventKind {
        StoreEventKind::ConfigUpdate
    }
}

/// Holds the current raw value of every declared property.
///
/// The store is seeded with the template defaults. Reads are lock-free
/// snapshots; updates are serialized so that merging, diffing and notifying
/// listeners happen as one step per update.
///
/// # Examples
///
/// ```rust
/// use confsync::core::{ConfigStore, ConfigTemplate, TypedValue};
///
/// let template = ConfigTemplate::parse(r#"
/// version: v1
/// configuration:
///   - id: app
///     properties:
///       - id: port
///         type: number
///         default: 3000
/// "#)?;
/// let store = ConfigStore::load(&template);
///
/// let changes = store.apply_update([("app.port", "4000")]);
/// assert_eq!(changes["app.port"].old_value, TypedValue::Number(3000.0));
/// assert_eq!(store.get("app.port"), Some(TypedValue::Number(4000.0)));
/// # Ok::<(), confsync::error::ConfigError>(())
/// ```
pub struct ConfigStore {
    descriptors: BTreeMap<String, PropertyDescriptor>,
    defaults: Arc<RawValueMap>,
    current: ArcSwap<RawValueMap>,
    version: AtomicU64,
    write_lock: ReentrantMutex<()>,
    subscribers: SubscriberRegistry<ConfigUpdate>,
}

impl ConfigStore {
    /// Create a store for the template, seeded with its defaults.
    pub fn load(template: &ConfigTemplate) -> Self {
        let descriptors: BTreeMap<_, _> = template
            .properties()
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();

        let defaults: RawValueMap = descriptors
            .values()
            .map(|p| (p.id.clone(), p.default_raw.clone()))
            .collect();
        let defaults = Arc::new(defaults);

        Self {
            descriptors,
            current: ArcSwap::new(Arc::clone(&defaults)),
            defaults,
            version: AtomicU64::new(0),
            write_lock: ReentrantMutex::new(()),
            subscribers: SubscriberRegistry::new(),
        }
    }

    /// Parse a YAML template definition and create a store for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(Self::load(&ConfigTemplate::parse(yaml)?))
    }

    /// Snapshot of every raw value, defaults included.
    pub fn current_raw(&self) -> Arc<RawValueMap> {
        self.current.load_full()
    }

    /// Snapshot of every value coerced to its declared type.
    pub fn current_typed(&self) -> TypedValueMap {
        let raw = self.current.load();
        raw.iter()
            .filter_map(|(id, value)| {
                self.descriptors
                    .get(id)
                    .map(|descriptor| (id.clone(), descriptor.coerce(value)))
            })
            .collect()
    }

    /// Typed value of one property.
    ///
    /// Returns `None` (and logs a warning) if the property is not declared.
    pub fn get(&self, id: &str) -> Option<TypedValue> {
        let raw = self.current.load();
        match (self.descriptors.get(id), raw.get(id)) {
            (Some(descriptor), Some(value)) => Some(descriptor.coerce(value)),
            _ => {
                warn!(id, "Tried to get undefined config property");
                None
            }
        }
    }

    /// Raw value of one property.
    ///
    /// Returns `None` (and logs a warning) if the property is not declared.
    pub fn get_raw(&self, id: &str) -> Option<String> {
        let value = self.current.load().get(id).cloned();
        if value.is_none() {
            warn!(id, "Tried to get undefined config property");
        }
        value
    }

    /// The template defaults.
    pub fn defaults(&self) -> Arc<RawValueMap> {
        Arc::clone(&self.defaults)
    }

    /// Descriptor of one declared property.
    pub fn descriptor(&self, id: &str) -> Option<&PropertyDescriptor> {
        self.descriptors.get(id)
    }

    /// Every declared property, ordered by qualified id.
    pub fn descriptors(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.descriptors.values()
    }

    /// Number of updates that changed at least one value.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Merge new raw values into the store and report what changed.
    ///
    /// Ids that are not declared in the template are ignored; when an id
    /// appears more than once, its last value wins. A property is
    /// reported as changed only when its raw string differs from the current
    /// one; the defaults count as the current value until first overwritten.
    /// If anything changed, every subscriber is called with the full change
    /// set before this method returns.
    pub fn apply_update<I, K, V>(&self, new_raw: I) -> ChangeSet
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let _guard = self.write_lock.lock();

        let previous = self.current.load_full();
        let mut next: Option<RawValueMap> = None;
        let mut changes = ChangeSet::new();

        let mut incoming = RawValueMap::new();
        for (id, value) in new_raw {
            let id = id.as_ref();
            if !self.descriptors.contains_key(id) {
                debug!(id, "Ignoring update for undeclared config property");
                continue;
            }
            incoming.insert(id.to_string(), value.into());
        }

        for (id, value) in incoming {
            let Some(descriptor) = self.descriptors.get(&id) else {
                continue;
            };
            let old = previous.get(&id).map(String::as_str).unwrap_or_default();
            if old == value {
                continue;
            }

            let new_value = descriptor.coerce(&value);
            if new_value.as_f64().is_some_and(f64::is_nan) {
                warn!(id = %id, raw = %value, "Numeric config property is not a number");
            }

            changes.insert(
                id.clone(),
                ChangeRecord {
                    old_value: descriptor.coerce(old),
                    new_value,
                },
            );
            next.get_or_insert_with(|| (*previous).clone())
                .insert(id, value);
        }

        let Some(next) = next else {
            return changes;
        };

        self.current.store(Arc::new(next));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

        debug!(changed = changes.len(), version, "Applied config update");

        self.subscribers.notify(&ConfigUpdate {
            changes: changes.clone(),
            version,
        });

        changes
    }

    /// Subscribe to config updates.
    ///
    /// The callback runs synchronously inside [`apply_update`](Self::apply_update),
    /// in subscription order. Returns a handle that unsubscribes when dropped.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ConfigUpdate) + Send + Sync + 'static,
    {
        self.subscribers
            .subscribe(StoreEventKind::ConfigUpdate, callback)
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .subscriber_count(StoreEventKind::ConfigUpdate)
    }
}
