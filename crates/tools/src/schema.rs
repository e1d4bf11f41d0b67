//! Declarative parameter lists and the JSON-Schema subset generated from them.

use serde_json::{Map, Value, json};

/// Parameter type, mapped onto JSON-Schema types.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    /// text → `string`
    String,
    /// integer → `integer`
    Integer,
    /// floating → `number`
    Number,
    /// boolean → `boolean`
    Boolean,
    /// sequence → `array`, with `items` when the element kind is known
    Array(Option<Box<ParamKind>>),
    /// structured value → `object` with its own `properties`/`required`
    Object(Vec<Param>),
    /// free-form mapping → `object`
    Map,
    /// unannotated: only a description is emitted
    Any,
}

impl ParamKind {
    pub fn array_of(item: ParamKind) -> Self {
        Self::Array(Some(Box::new(item)))
    }

    fn type_name(&self) -> Option<&'static str> {
        match self {
            Self::String => Some("string"),
            Self::Integer => Some("integer"),
            Self::Number => Some("number"),
            Self::Boolean => Some("boolean"),
            Self::Array(_) => Some("array"),
            Self::Object(_) | Self::Map => Some("object"),
            Self::Any => None,
        }
    }
}

/// One named parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub description: Option<String>,
    /// `None` means required. `Some(Value::Null)` is an optional parameter
    /// without a concrete default.
    pub default: Option<Value>,
}

impl Param {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Boolean)
    }

    pub fn array(name: impl Into<String>, item: ParamKind) -> Self {
        Self::new(name, ParamKind::array_of(item))
    }

    pub fn object(name: impl Into<String>, fields: Vec<Param>) -> Self {
        Self::new(name, ParamKind::Object(fields))
    }

    pub fn map(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Map)
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Any)
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Marks the parameter optional without a concrete default.
    pub fn optional(self) -> Self {
        self.default(Value::Null)
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Registration-time description of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<Param>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    /// Adds one top-level parameter.
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Declares a single structured argument whose fields become the
    /// top-level properties.
    pub fn fields(mut self, fields: Vec<Param>) -> Self {
        self.params = fields;
        self
    }

    pub fn parameters_schema(&self) -> Value {
        object_schema(&self.params)
    }
}

fn object_schema(params: &[Param]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        properties.insert(param.name.clone(), param_schema(param));
        if param.is_required() {
            required.push(Value::String(param.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn param_schema(param: &Param) -> Value {
    let mut schema = match kind_schema(&param.kind) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(description) = &param.description {
        schema.insert("description".to_string(), Value::String(description.clone()));
    }
    if let Some(default) = &param.default
        && !default.is_null()
    {
        schema.insert("default".to_string(), default.clone());
    }
    Value::Object(schema)
}

fn kind_schema(kind: &ParamKind) -> Value {
    match kind {
        ParamKind::Object(fields) => object_schema(fields),
        ParamKind::Array(items) => {
            let mut schema = Map::new();
            schema.insert("type".to_string(), Value::from("array"));
            if let Some(item) = items {
                schema.insert("items".to_string(), kind_schema(item));
            }
            Value::Object(schema)
        }
        other => match other.type_name() {
            Some(ty) => json!({ "type": ty }),
            None => json!({}),
        },
    }
}
