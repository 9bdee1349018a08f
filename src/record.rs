use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Backend-assigned identity of a stored server.
///
/// `0` (or anything negative) means the record has not been stored yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub i64);

impl ServerId {
    pub const UNASSIGNED: ServerId = ServerId(0);

    /// True once the backend has assigned this identity.
    pub fn is_assigned(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ServerId {
    fn from(id: i64) -> Self {
        ServerId(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Rdp,
    Ssh,
    Telnet,
    Vnc,
    Ftp,
    Sftp,
    App,
}

impl ProtocolKind {
    /// Well-known port for the protocol, `0` for local applications.
    pub fn default_port(self) -> u16 {
        match self {
            ProtocolKind::Rdp => 3389,
            ProtocolKind::Ssh | ProtocolKind::Sftp => 22,
            ProtocolKind::Telnet => 23,
            ProtocolKind::Vnc => 5900,
            ProtocolKind::Ftp => 21,
            ProtocolKind::App => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Rdp => "rdp",
            ProtocolKind::Ssh => "ssh",
            ProtocolKind::Telnet => "telnet",
            ProtocolKind::Vnc => "vnc",
            ProtocolKind::Ftp => "ftp",
            ProtocolKind::Sftp => "sftp",
            ProtocolKind::App => "app",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rdp" => Ok(ProtocolKind::Rdp),
            "ssh" => Ok(ProtocolKind::Ssh),
            "telnet" => Ok(ProtocolKind::Telnet),
            "vnc" => Ok(ProtocolKind::Vnc),
            "ftp" => Ok(ProtocolKind::Ftp),
            "sftp" => Ok(ProtocolKind::Sftp),
            "app" => Ok(ProtocolKind::App),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Protocol-specific connection details.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFields {
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectionFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFields")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("extra", &self.extra)
            .finish()
    }
}

/// Connection fields as held by a record: sealed at rest, open only in
/// working memory after the store has decrypted them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealedFields {
    Sealed(String),
    Open(ConnectionFields),
}

impl SealedFields {
    pub fn is_open(&self) -> bool {
        matches!(self, SealedFields::Open(_))
    }

    pub fn as_open(&self) -> Option<&ConnectionFields> {
        match self {
            SealedFields::Open(fields) => Some(fields),
            SealedFields::Sealed(_) => None,
        }
    }
}

/// A stored remote target profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(default)]
    pub id: ServerId,
    pub display_name: String,
    #[serde(default)]
    pub subtitle: String,
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub fields: SealedFields,
}

impl ServerRecord {
    /// A not-yet-stored record with open connection fields.
    pub fn new(display_name: impl Into<String>, protocol: ProtocolKind, fields: ConnectionFields) -> Self {
        Self {
            id: ServerId::UNASSIGNED,
            display_name: display_name.into(),
            subtitle: String::new(),
            protocol,
            tags: Vec::new(),
            icon: None,
            fields: SealedFields::Open(fields),
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = subtitle.into();
        self
    }

    /// "name - subtitle", or just the name when there is no subtitle.
    pub fn title(&self) -> String {
        if self.subtitle.is_empty() {
            self.display_name.clone()
        } else {
            format!("{} - {}", self.display_name, self.subtitle)
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
