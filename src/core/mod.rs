//! Core configuration types: templates, typed values and the value store.

mod store;
mod template;
mod value;

pub use store::{
    ChangeRecord, ChangeSet, ConfigStore, ConfigUpdate, RawValueMap, StoreEventKind,
    TypedValueMap,
};
pub use template::{
    ConfigGroup, ConfigTemplate, DefaultValue, PropertyDefinition, PropertyDescriptor,
    TemplateVersion,
};
pub use value::{PropertyType, TypedValue};
