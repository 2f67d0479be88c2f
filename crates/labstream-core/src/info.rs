//! Stream descriptors and typed sample values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};
use std::{fmt, io, net::SocketAddr, str::FromStr};
use uuid::Uuid;

/// Nominal rate of streams without a regular sampling rate.
pub const IRREGULAR_RATE: f64 = 0.0;

/// Session that streams belong to unless configured otherwise.
pub const DEFAULT_SESSION: &str = "default";

/// Value type shared by all channels of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFormat {
    Float32,
    Double64,
    String,
    Int32,
    Int16,
    Int8,
    Int64,
}

impl ChannelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Double64 => "double64",
            Self::String => "string",
            Self::Int32 => "int32",
            Self::Int16 => "int16",
            Self::Int8 => "int8",
            Self::Int64 => "int64",
        }
    }
}

impl fmt::Display for ChannelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let format = match s.strip_prefix("cf_").unwrap_or(s) {
            "float32" => Self::Float32,
            "double64" | "float64" => Self::Double64,
            "string" => Self::String,
            "int32" => Self::Int32,
            "int16" => Self::Int16,
            "int8" => Self::Int8,
            "int64" => Self::Int64,
            other => return Err(Error::invalid(format!("unknown channel format '{other}'"))),
        };
        Ok(format)
    }
}

/// The channel values of one sample, tagged with their format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "lowercase")]
pub enum Values {
    Float32(#[serde(with = "float_seq")] Vec<f32>),
    Double64(#[serde(with = "float_seq")] Vec<f64>),
    String(Vec<String>),
    Int32(Vec<i32>),
    Int16(Vec<i16>),
    Int8(Vec<i8>),
    Int64(Vec<i64>),
}

impl Values {
    pub fn format(&self) -> ChannelFormat {
        match self {
            Self::Float32(_) => ChannelFormat::Float32,
            Self::Double64(_) => ChannelFormat::Double64,
            Self::String(_) => ChannelFormat::String,
            Self::Int32(_) => ChannelFormat::Int32,
            Self::Int16(_) => ChannelFormat::Int16,
            Self::Int8(_) => ChannelFormat::Int8,
            Self::Int64(_) => ChannelFormat::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float32(v) => v.len(),
            Self::Double64(v) => v.len(),
            Self::String(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::Int8(v) => v.len(),
            Self::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON has no representation for NaN and infinities, which are common
/// in physiological recordings; those travel as strings.
mod float_seq {
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

    pub trait Float: Copy {
        fn to_f64(self) -> f64;
        fn from_f64(value: f64) -> Self;
    }

    impl Float for f32 {
        fn to_f64(self) -> f64 {
            self as f64
        }

        fn from_f64(value: f64) -> Self {
            value as f32
        }
    }

    impl Float for f64 {
        fn to_f64(self) -> f64 {
            self
        }

        fn from_f64(value: f64) -> Self {
            value
        }
    }

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Special(String),
    }

    pub fn serialize<S, T>(values: &[T], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Float,
    {
        serializer.collect_seq(values.iter().map(|v| {
            let v = v.to_f64();
            if v.is_finite() {
                Repr::Num(v)
            } else if v.is_nan() {
                Repr::Special("nan".into())
            } else if v > 0.0 {
                Repr::Special("inf".into())
            } else {
                Repr::Special("-inf".into())
            }
        }))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Float,
    {
        Vec::<Repr>::deserialize(deserializer)?
            .into_iter()
            .map(|repr| {
                let v = match repr {
                    Repr::Num(v) => v,
                    Repr::Special(s) => match s.as_str() {
                        "nan" => f64::NAN,
                        "inf" => f64::INFINITY,
                        "-inf" => f64::NEG_INFINITY,
                        other => return Err(D::Error::custom(format!("invalid float '{other}'"))),
                    },
                };
                Ok(T::from_f64(v))
            })
            .collect()
    }
}

macro_rules! impl_values_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for Values {
                fn from(values: Vec<$ty>) -> Self {
                    Self::$variant(values)
                }
            }

            impl From<&[$ty]> for Values {
                fn from(values: &[$ty]) -> Self {
                    Self::$variant(values.to_vec())
                }
            }
        )*
    };
}

impl_values_from! {
    f32 => Float32,
    f64 => Double64,
    String => String,
    i32 => Int32,
    i16 => Int16,
    i8 => Int8,
    i64 => Int64,
}

impl From<Vec<&str>> for Values {
    fn from(values: Vec<&str>) -> Self {
        Self::String(values.into_iter().map(str::to_owned).collect())
    }
}

/// One observation: a value per channel and its capture time on the
/// producer's clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub values: Values,
}

impl Sample {
    pub fn new(values: impl Into<Values>, timestamp: f64) -> Self {
        Self {
            timestamp,
            values: values.into(),
        }
    }
}

/// A node of the extended metadata tree. Children keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DescNode>,
}

impl DescNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends an empty child and returns it.
    pub fn append_child(&mut self, name: impl Into<String>) -> &mut DescNode {
        self.children.push(DescNode::new(name));
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Appends a leaf child holding `value`; returns `self` for chaining.
    pub fn append_child_value(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.children.push(DescNode {
            name: name.into(),
            value: value.into(),
            children: Vec::new(),
        });
        self
    }

    /// Inserts an empty child before the existing ones and returns it.
    pub fn prepend_child(&mut self, name: impl Into<String>) -> &mut DescNode {
        self.children.insert(0, DescNode::new(name));
        &mut self.children[0]
    }

    pub fn prepend_child_value(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.children.insert(
            0,
            DescNode {
                name: name.into(),
                value: value.into(),
                children: Vec::new(),
            },
        );
        self
    }

    /// Appends a whole subtree, e.g. one copied from another stream.
    pub fn append_node(&mut self, node: DescNode) -> &mut DescNode {
        self.children.push(node);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn first_child(&self) -> Option<&DescNode> {
        self.children.first()
    }

    pub fn last_child(&self) -> Option<&DescNode> {
        self.children.last()
    }

    /// The child following the first one named `after`. With `name`,
    /// skips ahead to the next child of that name.
    pub fn next_sibling(&self, after: &str, name: Option<&str>) -> Option<&DescNode> {
        let pos = self.children.iter().position(|c| c.name == after)?;
        self.children[pos + 1..]
            .iter()
            .find(|c| name.is_none_or(|name| c.name == name))
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&DescNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut DescNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// All children with the given name, in order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DescNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.value.as_str())
    }

    /// Overwrites the value of the first child named `name`, creating it
    /// if missing.
    pub fn set_child_value(&mut self, name: &str, value: impl Into<String>) {
        match self.child_mut(name) {
            Some(child) => child.value = value.into(),
            None => {
                self.append_child_value(name, value);
            }
        }
    }

    /// Removes and returns the first child named `name`.
    pub fn remove_child(&mut self, name: &str) -> Option<DescNode> {
        let pos = self.children.iter().position(|c| c.name == name)?;
        Some(self.children.remove(pos))
    }

    /// Follows a `/`-separated path of child names.
    pub fn path(&self, path: &str) -> Option<&DescNode> {
        path.split('/')
            .filter(|seg| !seg.is_empty())
            .try_fold(self, |node, seg| node.child(seg))
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty() && self.children.is_empty()
    }
}

/// Immutable descriptor of a stream's identity, schema and metadata.
///
/// The hosting fields (`uid`, `hostname`, `created_at`, `data_port`) are
/// filled in when an outlet is created; `endpoint` is filled in by the
/// resolver that found the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    name: String,
    #[serde(rename = "type")]
    type_: String,
    channel_count: u32,
    nominal_srate: f64,
    channel_format: ChannelFormat,
    source_id: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    hostname: String,
    #[serde(default = "default_session")]
    session_id: String,
    #[serde(default)]
    created_at: f64,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    data_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<SocketAddr>,
    #[serde(default)]
    desc: DescNode,
}

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

impl StreamInfo {
    /// Creates a descriptor. An empty `source_id` is replaced by a value
    /// derived from the other core fields.
    pub fn new(
        name: impl Into<String>,
        type_: impl Into<String>,
        channel_count: u32,
        nominal_srate: f64,
        channel_format: ChannelFormat,
        source_id: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let type_ = type_.into();
        let mut source_id = source_id.into();

        if name.is_empty() {
            return Err(Error::invalid("stream name must not be empty"));
        }
        if channel_count == 0 {
            return Err(Error::invalid("channel_count must be positive"));
        }
        if !nominal_srate.is_finite() || nominal_srate < 0.0 {
            return Err(Error::invalid(format!(
                "nominal_srate must be a non-negative number, got {nominal_srate}"
            )));
        }
        if source_id.is_empty() {
            source_id = derive_source_id(&name, &type_, channel_count, nominal_srate, channel_format);
        }

        Ok(Self {
            name,
            type_,
            channel_count,
            nominal_srate,
            channel_format,
            source_id,
            uid: String::new(),
            hostname: String::new(),
            session_id: default_session(),
            created_at: 0.0,
            version: crate::PROTOCOL_VERSION,
            data_port: 0,
            endpoint: None,
            desc: DescNode::new("desc"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_(&self) -> &str {
        &self.type_
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    pub fn nominal_srate(&self) -> f64 {
        self.nominal_srate
    }

    pub fn channel_format(&self) -> ChannelFormat {
        self.channel_format
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// Data-plane address as seen from the resolving host.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub fn desc(&self) -> &DescNode {
        &self.desc
    }

    pub fn desc_mut(&mut self) -> &mut DescNode {
        &mut self.desc
    }

    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
    }

    /// Whether both descriptors denote the same logical stream. Distinct
    /// `uid`s still mark distinct incarnations.
    pub fn same_source(&self, other: &StreamInfo) -> bool {
        self.source_id == other.source_id && self.name == other.name && self.type_ == other.type_
    }

    /// Looks up a core property by name, or a metadata value by a
    /// `desc/...` path.
    pub fn property(&self, prop: &str) -> Option<String> {
        let value = match prop {
            "name" => self.name.clone(),
            "type" => self.type_.clone(),
            "channel_count" => self.channel_count.to_string(),
            "nominal_srate" => self.nominal_srate.to_string(),
            "channel_format" => self.channel_format.to_string(),
            "source_id" => self.source_id.clone(),
            "uid" => self.uid.clone(),
            "hostname" => self.hostname.clone(),
            "session_id" => self.session_id.clone(),
            "version" => self.version.to_string(),
            "created_at" => self.created_at.to_string(),
            path => {
                let rest = path.strip_prefix("desc/")?;
                return self.desc.path(rest).map(|node| node.value.clone());
            }
        };
        Some(value)
    }

    /// Checks a sample against the channel count and format.
    pub fn validate(&self, values: &Values) -> Result<()> {
        if values.format() != self.channel_format {
            return Err(Error::invalid(format!(
                "stream '{}' carries {} values, got {}",
                self.name,
                self.channel_format,
                values.format()
            )));
        }
        if values.len() != self.channel_count as usize {
            return Err(Error::invalid(format!(
                "stream '{}' has {} channels, got {} values",
                self.name,
                self.channel_count,
                values.len()
            )));
        }
        Ok(())
    }

    pub fn set_channel_labels<S: AsRef<str>>(&mut self, labels: &[S]) -> Result<()> {
        self.set_channel_field("label", labels)
    }

    pub fn set_channel_types<S: AsRef<str>>(&mut self, types: &[S]) -> Result<()> {
        self.set_channel_field("type", types)
    }

    pub fn set_channel_units<S: AsRef<str>>(&mut self, units: &[S]) -> Result<()> {
        self.set_channel_field("unit", units)
    }

    pub fn channel_labels(&self) -> Option<Vec<Option<String>>> {
        self.channel_field("label")
    }

    pub fn channel_types(&self) -> Option<Vec<Option<String>>> {
        self.channel_field("type")
    }

    pub fn channel_units(&self) -> Option<Vec<Option<String>>> {
        self.channel_field("unit")
    }

    fn set_channel_field<S: AsRef<str>>(&mut self, key: &str, values: &[S]) -> Result<()> {
        if values.len() != self.channel_count as usize {
            return Err(Error::invalid(format!(
                "got {} channel {key}s for {} channels",
                values.len(),
                self.channel_count
            )));
        }

        if self.desc.child("channels").is_none() {
            self.desc.append_child("channels");
        }
        let channels = self
            .desc
            .child_mut("channels")
            .ok_or_else(|| Error::invalid("metadata has no channels node"))?;

        let mut existing = channels.children.iter().filter(|c| c.name == "channel").count();
        while existing < values.len() {
            channels.append_child("channel");
            existing += 1;
        }

        let mut index = 0;
        channels.children.retain(|c| {
            if c.name != "channel" {
                return true;
            }
            index += 1;
            index <= values.len()
        });

        channels
            .children
            .iter_mut()
            .filter(|c| c.name == "channel")
            .zip(values)
            .for_each(|(channel, value)| channel.set_child_value(key, value.as_ref()));
        Ok(())
    }

    fn channel_field(&self, key: &str) -> Option<Vec<Option<String>>> {
        let channels = self.desc.child("channels")?;
        let values: Vec<Option<String>> = channels
            .children_named("channel")
            .map(|ch| {
                ch.child_value(key)
                    .filter(|v| !v.is_empty())
                    .map(str::to_owned)
            })
            .collect();
        if values.iter().all(Option::is_none) {
            return None;
        }
        Some(values)
    }

    /// Copy without the extended metadata, as carried in announcements.
    pub(crate) fn without_desc(&self) -> Self {
        Self {
            desc: DescNode::new("desc"),
            ..self.clone()
        }
    }

    pub(crate) fn bind_host(&mut self, uid: String, hostname: String, data_port: u16, created_at: f64) {
        self.uid = uid;
        self.hostname = hostname;
        self.data_port = data_port;
        self.created_at = created_at;
    }

    /// Overrides the data-plane address, e.g. to reach an outlet
    /// through a relay.
    pub fn set_endpoint(&mut self, endpoint: SocketAddr) {
        self.endpoint = Some(endpoint);
    }

    /// The whole description as an XML document rooted at `<info>`, laid
    /// out like an XDF stream header with the metadata tree under `<desc>`.
    pub fn as_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("info")))?;

        let fields = [
            ("name", self.name.clone()),
            ("type", self.type_.clone()),
            ("channel_count", self.channel_count.to_string()),
            ("channel_format", self.channel_format.to_string()),
            ("source_id", self.source_id.clone()),
            ("nominal_srate", self.nominal_srate.to_string()),
            ("version", self.version.to_string()),
            ("created_at", self.created_at.to_string()),
            ("uid", self.uid.clone()),
            ("session_id", self.session_id.clone()),
            ("hostname", self.hostname.clone()),
            ("data_port", self.data_port.to_string()),
        ];
        for (tag, text) in &fields {
            write_element(&mut writer, tag, text, &[])?;
        }
        write_element(&mut writer, "desc", &self.desc.value, &self.desc.children)?;

        writer.write_event(Event::End(BytesEnd::new("info")))?;
        String::from_utf8(writer.into_inner()).map_err(|err| Error::protocol(err.to_string()))
    }
}

fn write_element(
    writer: &mut Writer<Vec<u8>>,
    tag: &str,
    text: &str,
    children: &[DescNode],
) -> io::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    if !text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    for child in children {
        write_element(writer, &child.name, &child.value, &child.children)?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))
}

fn derive_source_id(
    name: &str,
    type_: &str,
    channel_count: u32,
    nominal_srate: f64,
    channel_format: ChannelFormat,
) -> String {
    // Name-based UUID, so every build derives the same id.
    let key = format!(
        "{name}\0{type_}\0{channel_count}\0{}\0{}",
        nominal_srate.to_bits(),
        channel_format.as_str()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eeg_info() -> StreamInfo {
        StreamInfo::new("BioSemi", "EEG", 4, 512.0, ChannelFormat::Float32, "biosemi-1").unwrap()
    }

    #[test]
    fn test_rejects_invalid_core_fields() {
        assert!(StreamInfo::new("", "EEG", 1, 0.0, ChannelFormat::Float32, "").is_err());
        assert!(StreamInfo::new("x", "EEG", 0, 0.0, ChannelFormat::Float32, "").is_err());
        assert!(StreamInfo::new("x", "EEG", 1, -1.0, ChannelFormat::Float32, "").is_err());
        assert!(StreamInfo::new("x", "EEG", 1, f64::NAN, ChannelFormat::Float32, "").is_err());
    }

    #[test]
    fn test_empty_source_id_is_derived_deterministically() {
        let a = StreamInfo::new("m", "Markers", 1, IRREGULAR_RATE, ChannelFormat::String, "").unwrap();
        let b = StreamInfo::new("m", "Markers", 1, IRREGULAR_RATE, ChannelFormat::String, "").unwrap();
        let c = StreamInfo::new("m", "Markers", 2, IRREGULAR_RATE, ChannelFormat::String, "").unwrap();
        assert!(!a.source_id().is_empty());
        assert_eq!(a.source_id(), b.source_id());
        assert_ne!(a.source_id(), c.source_id());
        assert_eq!(a.source_id(), "77459d67-2c7d-5148-a4db-f9425f5c2160");
    }

    #[test]
    fn test_channel_format_parsing() {
        assert_eq!("float32".parse::<ChannelFormat>().unwrap(), ChannelFormat::Float32);
        assert_eq!("float64".parse::<ChannelFormat>().unwrap(), ChannelFormat::Double64);
        assert_eq!("cf_int16".parse::<ChannelFormat>().unwrap(), ChannelFormat::Int16);
        assert!("complex".parse::<ChannelFormat>().is_err());
    }

    #[test]
    fn test_validate_rejects_type_and_count_mismatch() {
        let info = eeg_info();
        assert!(info.validate(&vec![1.0f32, 2.0, 3.0, 4.0].into()).is_ok());
        assert!(info.validate(&vec![1.0f64, 2.0, 3.0, 4.0].into()).is_err());
        assert!(info.validate(&vec![1.0f32, 2.0].into()).is_err());
    }

    #[test]
    fn test_channel_labels_roundtrip_and_overwrite() {
        let mut info = eeg_info();
        assert!(info.channel_labels().is_none());

        info.set_channel_labels(&["C3", "C4", "Cz", "Pz"]).unwrap();
        info.set_channel_units(&["uV"; 4]).unwrap();
        info.set_channel_labels(&["F3", "F4", "Fz", "Oz"]).unwrap();

        let labels: Vec<_> = info.channel_labels().unwrap().into_iter().flatten().collect();
        assert_eq!(labels, ["F3", "F4", "Fz", "Oz"]);
        assert_eq!(info.channel_units().unwrap().len(), 4);
        assert!(info.channel_types().is_none());
        assert!(info.set_channel_labels(&["only-one"]).is_err());
    }

    #[test]
    fn test_property_lookup_reaches_metadata() {
        let mut info = eeg_info();
        info.desc_mut().append_child_value("manufacturer", "Biosemi");
        info.desc_mut()
            .append_child("acquisition")
            .append_child_value("reference", "CMS");

        assert_eq!(info.property("type").as_deref(), Some("EEG"));
        assert_eq!(info.property("channel_count").as_deref(), Some("4"));
        assert_eq!(info.property("desc/manufacturer").as_deref(), Some("Biosemi"));
        assert_eq!(info.property("desc/acquisition/reference").as_deref(), Some("CMS"));
        assert!(info.property("desc/missing").is_none());
        assert!(info.property("bogus").is_none());
    }

    #[test]
    fn test_non_finite_values_survive_json() {
        let sample = Sample::new(vec![f32::NAN, f32::INFINITY, -1.5], 2.0);
        let json = serde_json::to_string(&sample).unwrap();
        let back: Sample = serde_json::from_str(&json).unwrap();
        let Values::Float32(values) = back.values else {
            panic!("format changed");
        };
        assert!(values[0].is_nan());
        assert_eq!(values[1], f32::INFINITY);
        assert_eq!(values[2], -1.5);
    }

    #[test]
    fn test_desc_node_editing() {
        let mut node = DescNode::new("desc");
        node.append_child_value("a", "1").append_child_value("b", "2");
        node.set_child_value("a", "3");
        node.set_child_value("c", "4");
        assert_eq!(node.child_value("a"), Some("3"));
        assert_eq!(node.child_value("c"), Some("4"));
        assert_eq!(node.remove_child("b").unwrap().value, "2");
        assert!(node.child("b").is_none());
    }

    #[test]
    fn test_desc_node_navigation() {
        let mut node = DescNode::new("desc");
        node.append_child_value("b", "2").append_child_value("c", "3");
        node.prepend_child_value("a", "1");
        node.append_child_value("b", "4");

        assert_eq!(node.first_child().map(|c| c.value.as_str()), Some("1"));
        assert_eq!(node.last_child().map(|c| c.value.as_str()), Some("4"));
        assert_eq!(node.next_sibling("a", None).map(|c| c.name.as_str()), Some("b"));
        assert_eq!(node.next_sibling("b", Some("b")).map(|c| c.value.as_str()), Some("4"));
        assert!(node.next_sibling("c", Some("a")).is_none());

        let copied = node.clone();
        node.prepend_child("empty");
        node.append_node(copied).name = "copy".into();
        assert_eq!(node.first_child().map(|c| c.name.as_str()), Some("empty"));
        assert_eq!(node.path("copy/c").map(|c| c.value.as_str()), Some("3"));
    }

    #[test]
    fn test_as_xml_nests_metadata_and_escapes_text() {
        let mut info = eeg_info();
        info.set_channel_labels(&["Fp1", "Fp2", "C3", "C4"]).unwrap();
        info.desc_mut().append_child_value("note", "gain < 2 & stable");

        let xml = info.as_xml().unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<name>BioSemi</name>"));
        assert!(xml.contains("<channel_format>float32</channel_format>"));
        assert!(xml.contains("<source_id>biosemi-1</source_id>"));
        assert!(xml.contains("<label>C3</label>"));
        assert!(xml.contains("gain &lt; 2 &amp; stable"));

        let desc = xml.find("<desc>").unwrap();
        let channels = xml.find("<channels>").unwrap();
        assert!(desc < channels && channels < xml.find("</desc>").unwrap());
        assert!(xml.trim_end().ends_with("</info>"));
    }

    #[test]
    fn test_same_source_ignores_uid() {
        let mut a = eeg_info();
        let mut b = eeg_info();
        a.bind_host("uid-a".into(), "host".into(), 1000, 1.0);
        b.bind_host("uid-b".into(), "host".into(), 1001, 2.0);
        assert!(a.same_source(&b));
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn test_without_desc_strips_metadata() {
        let mut info = eeg_info();
        info.desc_mut().append_child_value("manufacturer", "Biosemi");
        let compact = info.without_desc();
        assert!(compact.desc().is_empty());
        assert_eq!(compact.name(), info.name());
    }
}
