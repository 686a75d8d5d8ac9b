use uuid::Uuid;

/// Native value type backing a `Descriptor` entry. Kept separate from the
/// generated `proto::descriptor::DescriptorValue` so internal code never has
/// to thread `Option`/oneof plumbing through the Stage Engine and Event
/// Ingest; conversion to/from the wire type happens only at the RPC
/// boundary (see `to_wire`/`from_wire`).
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    String(String),
    Uuid(Uuid),
    Url(url::Url),
    Data(Vec<u8>),
}

impl DescriptorValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DescriptorValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DescriptorValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DescriptorValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            DescriptorValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_url(&self) -> Option<&url::Url> {
        match self {
            DescriptorValue::Url(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            DescriptorValue::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> crate::proto::descriptor::DescriptorValue {
        use crate::proto::descriptor::descriptor_value::Value as W;
        let value = match self {
            DescriptorValue::Bool(v) => W::BoolValue(*v),
            DescriptorValue::UInt(v) => W::UintValue(*v),
            DescriptorValue::Int(v) => W::IntValue(*v),
            DescriptorValue::String(v) => W::StringValue(v.clone()),
            DescriptorValue::Uuid(v) => W::UuidValue(v.to_string()),
            DescriptorValue::Url(v) => W::UrlValue(v.to_string()),
            DescriptorValue::Data(v) => W::DataValue(v.clone()),
        };
        crate::proto::descriptor::DescriptorValue { value: Some(value) }
    }

    pub fn from_wire(wire: &crate::proto::descriptor::DescriptorValue) -> Option<Self> {
        use crate::proto::descriptor::descriptor_value::Value as W;
        match wire.value.as_ref()? {
            W::BoolValue(v) => Some(DescriptorValue::Bool(*v)),
            W::UintValue(v) => Some(DescriptorValue::UInt(*v)),
            W::IntValue(v) => Some(DescriptorValue::Int(*v)),
            W::StringValue(v) => Some(DescriptorValue::String(v.clone())),
            W::UuidValue(v) => Uuid::parse_str(v).ok().map(DescriptorValue::Uuid),
            W::UrlValue(v) => url::Url::parse(v).ok().map(DescriptorValue::Url),
            W::DataValue(v) => Some(DescriptorValue::Data(v.clone())),
        }
    }
}
