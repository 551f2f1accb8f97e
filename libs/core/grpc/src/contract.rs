//! Backward-compatibility checks between two versions of a message schema
//!
//! A change is breaking when a client built against the baseline schema can
//! no longer talk to a service using the current one:
//! - a field was removed
//! - a field changed type
//! - an optional field became required
//! - an enum field lost values
//!
//! Relaxations and additions are reported as warnings only.
//!
//! ## Example
//! ```ignore
//! let baseline = MessageSchema::from_descriptor(&old_file.message_type[0], &old_file);
//! let current = MessageSchema::from_descriptor(&new_file.message_type[0], &new_file);
//!
//! let result = ContractValidator::new().validate_backward_compatibility(&baseline, &current);
//! assert!(result.is_compatible(), "{result}");
//! ```

use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{DescriptorProto, EnumDescriptorProto, FileDescriptorProto};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{error, warn};

/// Wire type of a field, as declared in the `.proto`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Double,
    Float,
    Int64,
    Uint64,
    Int32,
    Fixed64,
    Fixed32,
    Bool,
    String,
    Group,
    Message,
    Bytes,
    Uint32,
    Enum,
    Sfixed32,
    Sfixed64,
    Sint32,
    Sint64,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Double => "DOUBLE",
            FieldType::Float => "FLOAT",
            FieldType::Int64 => "INT64",
            FieldType::Uint64 => "UINT64",
            FieldType::Int32 => "INT32",
            FieldType::Fixed64 => "FIXED64",
            FieldType::Fixed32 => "FIXED32",
            FieldType::Bool => "BOOL",
            FieldType::String => "STRING",
            FieldType::Group => "GROUP",
            FieldType::Message => "MESSAGE",
            FieldType::Bytes => "BYTES",
            FieldType::Uint32 => "UINT32",
            FieldType::Enum => "ENUM",
            FieldType::Sfixed32 => "SFIXED32",
            FieldType::Sfixed64 => "SFIXED64",
            FieldType::Sint32 => "SINT32",
            FieldType::Sint64 => "SINT64",
        };
        f.write_str(name)
    }
}

impl From<Type> for FieldType {
    fn from(value: Type) -> Self {
        match value {
            Type::Double => FieldType::Double,
            Type::Float => FieldType::Float,
            Type::Int64 => FieldType::Int64,
            Type::Uint64 => FieldType::Uint64,
            Type::Int32 => FieldType::Int32,
            Type::Fixed64 => FieldType::Fixed64,
            Type::Fixed32 => FieldType::Fixed32,
            Type::Bool => FieldType::Bool,
            Type::String => FieldType::String,
            Type::Group => FieldType::Group,
            Type::Message => FieldType::Message,
            Type::Bytes => FieldType::Bytes,
            Type::Uint32 => FieldType::Uint32,
            Type::Enum => FieldType::Enum,
            Type::Sfixed32 => FieldType::Sfixed32,
            Type::Sfixed64 => FieldType::Sfixed64,
            Type::Sint32 => FieldType::Sint32,
            Type::Sint64 => FieldType::Sint64,
        }
    }
}

/// Enum type referenced by an enum field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumSchema {
    pub name: String,
    /// Value names in declaration order
    pub values: Vec<String>,
}

impl EnumSchema {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn from_descriptor(descriptor: &EnumDescriptorProto) -> Self {
        Self::new(
            descriptor.name(),
            descriptor.value.iter().map(|v| v.name().to_string()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub field_type: FieldType,
    pub required: bool,
    /// Present for `Enum` fields whose enum type could be resolved
    pub enum_type: Option<EnumSchema>,
}

impl FieldSchema {
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            enum_type: None,
        }
    }

    pub fn required(field_type: FieldType) -> Self {
        Self {
            required: true,
            ..Self::optional(field_type)
        }
    }

    pub fn enumeration(enum_type: EnumSchema) -> Self {
        Self {
            enum_type: Some(enum_type),
            ..Self::optional(FieldType::Enum)
        }
    }
}

/// Fields of one message, keyed by field name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSchema {
    pub name: String,
    fields: BTreeMap<String, FieldSchema>,
}

impl MessageSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// Fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSchema)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Build from a compiled descriptor
    ///
    /// Enum fields are resolved by fully-qualified name against every enum
    /// declared in `file`, at top level or nested in any message. Use
    /// [`from_descriptor_in`](Self::from_descriptor_in) when enums come from
    /// imported files.
    pub fn from_descriptor(message: &DescriptorProto, file: &FileDescriptorProto) -> Self {
        Self::from_descriptor_in(message, std::slice::from_ref(file))
    }

    /// Like [`from_descriptor`](Self::from_descriptor), resolving enums across
    /// all of `files` (the message's file and its imports)
    ///
    /// An enum type found in none of them leaves `enum_type` empty; the
    /// validator then reports the field as not compared.
    pub fn from_descriptor_in(message: &DescriptorProto, files: &[FileDescriptorProto]) -> Self {
        let enums = EnumIndex::new(files);
        let mut schema = Self::new(message.name());
        for field in &message.field {
            let field_type = FieldType::from(field.r#type());
            let enum_type = if field_type == FieldType::Enum {
                let resolved = enums.resolve(field.type_name());
                if resolved.is_none() {
                    warn!(
                        target: "grpc_client",
                        message = message.name(),
                        field = field.name(),
                        type_name = field.type_name(),
                        "Enum type not found in the given descriptors"
                    );
                }
                resolved
            } else {
                None
            };
            schema.fields.insert(
                field.name().to_string(),
                FieldSchema {
                    field_type,
                    required: field.label() == Label::Required,
                    enum_type,
                },
            );
        }
        schema
    }
}

/// Every enum in a set of files, keyed by fully-qualified name (`.pkg.Outer.Kind`)
struct EnumIndex<'a> {
    enums: HashMap<String, &'a EnumDescriptorProto>,
}

impl<'a> EnumIndex<'a> {
    fn new(files: &'a [FileDescriptorProto]) -> Self {
        let mut enums = HashMap::new();
        for file in files {
            let scope = match file.package() {
                "" => String::new(),
                package => format!(".{package}"),
            };
            collect_enums(&scope, &file.enum_type, &file.message_type, &mut enums);
        }
        Self { enums }
    }

    fn resolve(&self, type_name: &str) -> Option<EnumSchema> {
        if type_name.starts_with('.') {
            return self.enums.get(type_name).map(|e| EnumSchema::from_descriptor(e));
        }
        // Relative names only appear in hand-written descriptors; accept an unambiguous suffix
        let suffix = format!(".{type_name}");
        let mut matches = self.enums.iter().filter(|(name, _)| name.ends_with(&suffix));
        match (matches.next(), matches.next()) {
            (Some((_, e)), None) => Some(EnumSchema::from_descriptor(e)),
            _ => None,
        }
    }
}

fn collect_enums<'a>(
    scope: &str,
    enum_types: &'a [EnumDescriptorProto],
    messages: &'a [DescriptorProto],
    out: &mut HashMap<String, &'a EnumDescriptorProto>,
) {
    for e in enum_types {
        out.insert(format!("{scope}.{}", e.name()), e);
    }
    for message in messages {
        let nested_scope = format!("{scope}.{}", message.name());
        collect_enums(&nested_scope, &message.enum_type, &message.nested_type, out);
    }
}

/// Breaking changes and warnings found by one validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    breaking_changes: Vec<String>,
    warnings: Vec<String>,
}

impl ValidationResult {
    pub fn add_breaking_change(&mut self, change: impl Into<String>) {
        let change = change.into();
        error!(target: "grpc_client", change = %change, "Breaking change detected");
        self.breaking_changes.push(change);
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        warn!(target: "grpc_client", warning = %warning, "Compatibility warning");
        self.warnings.push(warning);
    }

    pub fn is_compatible(&self) -> bool {
        self.breaking_changes.is_empty()
    }

    pub fn breaking_changes(&self) -> &[String] {
        &self.breaking_changes
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_compatible() {
            write!(f, "Compatible")?;
        } else {
            write!(f, "Incompatible ({} breaking change(s))", self.breaking_changes.len())?;
        }
        for change in &self.breaking_changes {
            write!(f, "\n  breaking: {change}")?;
        }
        for warning in &self.warnings {
            write!(f, "\n  warning: {warning}")?;
        }
        Ok(())
    }
}

/// Stateless schema comparator
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractValidator;

impl ContractValidator {
    pub fn new() -> Self {
        Self
    }

    /// Compare `current` against `baseline`; every check always runs
    pub fn validate_backward_compatibility(
        &self,
        baseline: &MessageSchema,
        current: &MessageSchema,
    ) -> ValidationResult {
        let mut result = ValidationResult::default();
        check_removed_fields(baseline, current, &mut result);
        check_type_changes(baseline, current, &mut result);
        check_required_changes(baseline, current, &mut result);
        check_enum_changes(baseline, current, &mut result);
        result
    }
}

/// Fields present in both schemas, in name order
fn common_fields<'a>(
    baseline: &'a MessageSchema,
    current: &'a MessageSchema,
) -> impl Iterator<Item = (&'a str, &'a FieldSchema, &'a FieldSchema)> {
    baseline
        .fields
        .iter()
        .filter_map(|(name, old)| current.fields.get(name).map(|new| (name.as_str(), old, new)))
}

fn check_removed_fields(baseline: &MessageSchema, current: &MessageSchema, result: &mut ValidationResult) {
    let removed: Vec<&str> = baseline
        .fields
        .keys()
        .filter(|name| !current.fields.contains_key(*name))
        .map(String::as_str)
        .collect();

    if !removed.is_empty() {
        result.add_breaking_change(format!("Removed fields detected: {}", removed.join(", ")));
    }
}

fn check_type_changes(baseline: &MessageSchema, current: &MessageSchema, result: &mut ValidationResult) {
    for (name, old, new) in common_fields(baseline, current) {
        if old.field_type != new.field_type {
            result.add_breaking_change(format!(
                "Field '{name}' type changed from {} to {}",
                old.field_type, new.field_type
            ));
        }
    }
}

fn check_required_changes(
    baseline: &MessageSchema,
    current: &MessageSchema,
    result: &mut ValidationResult,
) {
    for (name, old, new) in common_fields(baseline, current) {
        match (old.required, new.required) {
            (false, true) => {
                result.add_breaking_change(format!("Field '{name}' changed from optional to required"))
            }
            (true, false) => {
                result.add_warning(format!("Field '{name}' changed from required to optional"))
            }
            _ => {}
        }
    }

    for (name, field) in current.fields() {
        if field.required && baseline.field(name).is_none() {
            result.add_warning(format!("New required field '{name}' added"));
        }
    }
}

fn check_enum_changes(baseline: &MessageSchema, current: &MessageSchema, result: &mut ValidationResult) {
    for (name, old, new) in common_fields(baseline, current) {
        if old.field_type != FieldType::Enum || new.field_type != FieldType::Enum {
            continue;
        }
        let (Some(old_enum), Some(new_enum)) = (&old.enum_type, &new.enum_type) else {
            result.add_warning(format!(
                "Enum values of field '{name}' not compared: enum type unresolved"
            ));
            continue;
        };

        let removed: Vec<&str> = old_enum
            .values
            .iter()
            .filter(|v| !new_enum.values.contains(v))
            .map(String::as_str)
            .collect();
        if !removed.is_empty() {
            result.add_breaking_change(format!(
                "Enum '{}' removed values: {}",
                old_enum.name,
                removed.join(", ")
            ));
        }

        let added: Vec<&str> = new_enum
            .values
            .iter()
            .filter(|v| !old_enum.values.contains(v))
            .map(String::as_str)
            .collect();
        if !added.is_empty() {
            result.add_warning(format!(
                "Enum '{}' added values: {}",
                new_enum.name,
                added.join(", ")
            ));
        }
    }
}
