use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes")]
    pub version: Option<Vec<u8>>,

    #[serde(rename = "s")]
    pub sender: DHTSender,

    #[serde(flatten)]
    pub variant: DHTMessageVariant,
}

impl DHTMessage {
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes.as_ref())?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

/// Sender descriptor carried by every message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTSender {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(rename = "vn", with = "serde_bytes")]
    pub vendor: Vec<u8>,

    #[serde(rename = "vr")]
    pub version: u16,

    #[serde(rename = "i")]
    pub instance_id: u8,

    #[serde(rename = "f")]
    pub flags: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum DHTMessageVariant {
    #[serde(rename = "q")]
    Request(DHTRequestSpecific),

    #[serde(rename = "r")]
    Response(DHTResponseSpecific),

    #[serde(rename = "e")]
    Error(DHTErrorSpecific),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum DHTRequestSpecific {
    #[serde(rename = "ping")]
    Ping {},

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: DHTFindNodeRequestArguments,
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(rename = "a")]
        arguments: DHTFindValueRequestArguments,
    },

    #[serde(rename = "get_token")]
    GetSecurityToken {},

    #[serde(rename = "store")]
    Store {
        #[serde(rename = "a")]
        arguments: DHTStoreRequestArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "k")]
pub enum DHTResponseSpecific {
    #[serde(rename = "pong")]
    Pong {
        #[serde(rename = "r")]
        arguments: DHTPongResponseArguments,
    },

    #[serde(rename = "nodes")]
    FindNode {
        #[serde(rename = "r")]
        arguments: DHTFindNodeResponseArguments,
    },

    #[serde(rename = "values")]
    FindValue {
        #[serde(rename = "r")]
        arguments: DHTFindValueResponseArguments,
    },

    #[serde(rename = "token")]
    SecurityToken {
        #[serde(rename = "r")]
        arguments: DHTSecurityTokenResponseArguments,
    },

    #[serde(rename = "stored")]
    Store {
        #[serde(rename = "r")]
        arguments: DHTStoreResponseArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTErrorSpecific {
    #[serde(rename = "e")]
    pub error_info: (i32, String),
}

// === PING ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTPongResponseArguments {
    /// Requester's address as seen by the responder.
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub ip: Option<Vec<u8>>,

    /// Responder's estimate of the Dht size.
    #[serde(rename = "n")]
    pub estimated_size: u64,
}

// === FIND NODE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindNodeRequestArguments {
    #[serde(with = "serde_bytes")]
    pub target: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindNodeResponseArguments {
    /// Compact contacts, `id + ip + port` each.
    pub nodes: Vec<ByteBuf>,

    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub token: Option<Vec<u8>>,
}

// === FIND VALUE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindValueRequestArguments {
    #[serde(with = "serde_bytes")]
    pub target: Vec<u8>,

    /// Secondary keys to restrict the response to, empty means all.
    #[serde(default)]
    pub keys: Vec<ByteBuf>,

    #[serde(rename = "vt")]
    pub value_type: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindValueResponseArguments {
    pub values: Vec<DHTValue>,
}

// === SECURITY TOKEN ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTSecurityTokenResponseArguments {
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

// === STORE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTStoreRequestArguments {
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,

    pub values: Vec<DHTValue>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTStoreResponseArguments {
    pub status: Vec<DHTStoreStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTStoreStatus {
    #[serde(with = "serde_bytes")]
    pub k: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub s: Vec<u8>,

    pub code: u8,
}

// === VALUES ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTValue {
    /// Primary key.
    #[serde(with = "serde_bytes")]
    pub k: Vec<u8>,

    /// Compact creator contact, its id is the secondary key.
    #[serde(with = "serde_bytes")]
    pub c: Vec<u8>,

    #[serde(rename = "vt")]
    pub value_type: u32,

    #[serde(rename = "vr")]
    pub version: u16,

    #[serde(with = "serde_bytes")]
    pub v: Vec<u8>,
}
