//! Serialize and deserialize Dht messages.

mod internal;

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use crate::common::{Contact, DhtValue, DhtValueEntity, Id, ValueType, ID_SIZE};
use crate::error::DecodeError;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u32,

    /// The protocol version of the sender.
    pub version: Option<Vec<u8>>,

    /// The sender of this message.
    ///
    /// On decoding, the address is the source address of the datagram.
    pub sender: Contact,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

/// Capability issued by a node to authorize STORE requests against it.
pub type SecurityToken = Vec<u8>;

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
    GetSecurityToken,
    Store(StoreRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Pong(PongResponseArguments),
    FindNode(FindNodeResponseArguments),
    FindValue(FindValueResponseArguments),
    SecurityToken(SecurityToken),
    Store(StoreResponseArguments),
}

// === PING ===

#[derive(Debug, PartialEq, Clone)]
pub struct PongResponseArguments {
    /// The requester's address as seen by the responder.
    pub external_address: Option<SocketAddr>,
    pub estimated_size: u64,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub contacts: Vec<Contact>,
    pub token: Option<SecurityToken>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub target: Id,
    pub secondary_keys: Vec<Id>,
    pub value_type: ValueType,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueResponseArguments {
    pub values: Vec<DhtValueEntity>,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub token: SecurityToken,
    pub values: Vec<DhtValueEntity>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StoreResponseArguments {
    pub status: Vec<StoreStatusEntry>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StoreStatusEntry {
    pub primary_key: Id,
    pub secondary_key: Id,
    pub code: StoreStatusCode,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// Per value outcome of a STORE request.
pub enum StoreStatusCode {
    Stored,
    /// The security token was missing, expired or issued to someone else.
    BadToken,
    /// The remote database refused the value (full, or too many values per key).
    Rejected,
}

impl StoreStatusCode {
    fn to_u8(self) -> u8 {
        match self {
            StoreStatusCode::Stored => 1,
            StoreStatusCode::BadToken => 2,
            StoreStatusCode::Rejected => 3,
        }
    }

    fn from_u8(code: u8) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(StoreStatusCode::Stored),
            2 => Ok(StoreStatusCode::BadToken),
            3 => Ok(StoreStatusCode::Rejected),
            _ => Err(DecodeError::InvalidStatusCode(code)),
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            version: self.version,
            sender: internal::DHTSender {
                id: self.sender.id.to_vec(),
                vendor: self.sender.vendor.to_vec(),
                version: self.sender.version,
                instance_id: self.sender.instance_id,
                flags: self.sender.flags,
            },
            variant: match self.message_type {
                MessageType::Request(request) => internal::DHTMessageVariant::Request(match request
                {
                    RequestSpecific::Ping => internal::DHTRequestSpecific::Ping {},
                    RequestSpecific::FindNode(args) => internal::DHTRequestSpecific::FindNode {
                        arguments: internal::DHTFindNodeRequestArguments {
                            target: args.target.to_vec(),
                        },
                    },
                    RequestSpecific::FindValue(args) => internal::DHTRequestSpecific::FindValue {
                        arguments: internal::DHTFindValueRequestArguments {
                            target: args.target.to_vec(),
                            keys: args
                                .secondary_keys
                                .iter()
                                .map(|id| serde_bytes::ByteBuf::from(id.to_vec()))
                                .collect(),
                            value_type: args.value_type.0,
                        },
                    },
                    RequestSpecific::GetSecurityToken => {
                        internal::DHTRequestSpecific::GetSecurityToken {}
                    }
                    RequestSpecific::Store(args) => internal::DHTRequestSpecific::Store {
                        arguments: internal::DHTStoreRequestArguments {
                            token: args.token,
                            values: args.values.iter().map(value_to_serde).collect(),
                        },
                    },
                }),

                MessageType::Response(response) => {
                    internal::DHTMessageVariant::Response(match response {
                        ResponseSpecific::Pong(args) => internal::DHTResponseSpecific::Pong {
                            arguments: internal::DHTPongResponseArguments {
                                ip: args.external_address.map(|a| sockaddr_to_bytes(&a)),
                                estimated_size: args.estimated_size,
                            },
                        },
                        ResponseSpecific::FindNode(args) => {
                            internal::DHTResponseSpecific::FindNode {
                                arguments: internal::DHTFindNodeResponseArguments {
                                    nodes: contacts_to_bytes(&args.contacts),
                                    token: args.token,
                                },
                            }
                        }
                        ResponseSpecific::FindValue(args) => {
                            internal::DHTResponseSpecific::FindValue {
                                arguments: internal::DHTFindValueResponseArguments {
                                    values: args.values.iter().map(value_to_serde).collect(),
                                },
                            }
                        }
                        ResponseSpecific::SecurityToken(token) => {
                            internal::DHTResponseSpecific::SecurityToken {
                                arguments: internal::DHTSecurityTokenResponseArguments { token },
                            }
                        }
                        ResponseSpecific::Store(args) => internal::DHTResponseSpecific::Store {
                            arguments: internal::DHTStoreResponseArguments {
                                status: args
                                    .status
                                    .iter()
                                    .map(|entry| internal::DHTStoreStatus {
                                        k: entry.primary_key.to_vec(),
                                        s: entry.secondary_key.to_vec(),
                                        code: entry.code.to_u8(),
                                    })
                                    .collect(),
                            },
                        },
                    })
                }

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (err.code, err.description),
                    })
                }
            },
        }
    }

    fn from_serde_message(
        msg: internal::DHTMessage,
        from: SocketAddr,
    ) -> Result<Message, DecodeError> {
        let vendor: [u8; 4] = msg
            .sender
            .vendor
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::InvalidVendor(msg.sender.vendor.clone()))?;

        let sender = Contact {
            id: Id::from_bytes(&msg.sender.id)?,
            address: from,
            vendor,
            version: msg.sender.version,
            instance_id: msg.sender.instance_id,
            flags: msg.sender.flags,
        };

        Ok(Message {
            transaction_id: transaction_id(msg.transaction_id)?,
            version: msg.version,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(request) => {
                    MessageType::Request(match request {
                        internal::DHTRequestSpecific::Ping {} => RequestSpecific::Ping,
                        internal::DHTRequestSpecific::FindNode { arguments } => {
                            RequestSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from_bytes(arguments.target)?,
                            })
                        }
                        internal::DHTRequestSpecific::FindValue { arguments } => {
                            RequestSpecific::FindValue(FindValueRequestArguments {
                                target: Id::from_bytes(arguments.target)?,
                                secondary_keys: arguments
                                    .keys
                                    .iter()
                                    .map(Id::from_bytes)
                                    .collect::<Result<_, _>>()?,
                                value_type: ValueType(arguments.value_type),
                            })
                        }
                        internal::DHTRequestSpecific::GetSecurityToken {} => {
                            RequestSpecific::GetSecurityToken
                        }
                        internal::DHTRequestSpecific::Store { arguments } => {
                            RequestSpecific::Store(StoreRequestArguments {
                                token: arguments.token,
                                values: arguments
                                    .values
                                    .into_iter()
                                    .map(|value| value_from_serde(value, &sender))
                                    .collect::<Result<_, _>>()?,
                            })
                        }
                    })
                }
                internal::DHTMessageVariant::Response(response) => {
                    MessageType::Response(match response {
                        internal::DHTResponseSpecific::Pong { arguments } => {
                            ResponseSpecific::Pong(PongResponseArguments {
                                external_address: match arguments.ip {
                                    Some(ip) => Some(bytes_to_sockaddr(ip)?),
                                    None => None,
                                },
                                estimated_size: arguments.estimated_size,
                            })
                        }
                        internal::DHTResponseSpecific::FindNode { arguments } => {
                            ResponseSpecific::FindNode(FindNodeResponseArguments {
                                contacts: bytes_to_contacts(&arguments.nodes)?,
                                token: arguments.token,
                            })
                        }
                        internal::DHTResponseSpecific::FindValue { arguments } => {
                            ResponseSpecific::FindValue(FindValueResponseArguments {
                                values: arguments
                                    .values
                                    .into_iter()
                                    .map(|value| value_from_serde(value, &sender))
                                    .collect::<Result<_, _>>()?,
                            })
                        }
                        internal::DHTResponseSpecific::SecurityToken { arguments } => {
                            ResponseSpecific::SecurityToken(arguments.token)
                        }
                        internal::DHTResponseSpecific::Store { arguments } => {
                            ResponseSpecific::Store(StoreResponseArguments {
                                status: arguments
                                    .status
                                    .into_iter()
                                    .map(|entry| {
                                        Ok(StoreStatusEntry {
                                            primary_key: Id::from_bytes(entry.k)?,
                                            secondary_key: Id::from_bytes(entry.s)?,
                                            code: StoreStatusCode::from_u8(entry.code)?,
                                        })
                                    })
                                    .collect::<Result<_, DecodeError>>()?,
                            })
                        }
                    })
                }
                internal::DHTMessageVariant::Error(err) => MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            },
            sender,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        self.clone().into_serde_message().to_bytes()
    }

    /// Decode a datagram received from `from`.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T, from: SocketAddr) -> Result<Message, DecodeError> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes)?, from)
    }

    /// If the response contains contacts closer to the target, return them.
    pub fn get_closer_contacts(&self) -> Option<&[Contact]> {
        match &self.message_type {
            MessageType::Response(response) => response.contacts(),
            _ => None,
        }
    }

    /// Returns the security token issued by the sender, if any.
    pub fn get_token(&self) -> Option<&SecurityToken> {
        match &self.message_type {
            MessageType::Response(response) => response.token(),
            _ => None,
        }
    }
}

impl ResponseSpecific {
    /// Contacts closer to the target, if this is a FIND_NODE response.
    pub fn contacts(&self) -> Option<&[Contact]> {
        match self {
            ResponseSpecific::FindNode(arguments) => Some(&arguments.contacts),
            _ => None,
        }
    }

    /// Security token issued by the responder, if any.
    pub fn token(&self) -> Option<&SecurityToken> {
        match self {
            ResponseSpecific::FindNode(arguments) => arguments.token.as_ref(),
            ResponseSpecific::SecurityToken(token) => Some(token),
            _ => None,
        }
    }
}

// Return the transaction Id as a u32
pub fn transaction_id(bytes: Vec<u8>) -> Result<u32, DecodeError> {
    let array: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| DecodeError::InvalidTransactionId(bytes.clone()))?;

    Ok(u32::from_be_bytes(array))
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr, DecodeError> {
    let bytes = bytes.as_ref();
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);

            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let octets: [u8; 16] = bytes[..16]
                .try_into()
                .map_err(|_| DecodeError::InvalidAddress(bytes.len()))?;
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(DecodeError::InvalidAddress(bytes.len())),
    }
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);

    match sockaddr {
        SocketAddr::V4(v4) => bytes.extend_from_slice(&v4.ip().octets()),
        SocketAddr::V6(v6) => bytes.extend_from_slice(&v6.ip().octets()),
    }

    bytes.extend_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

fn contact_to_bytes(contact: &Contact) -> Vec<u8> {
    let mut bytes = contact.id.to_vec();
    bytes.append(&mut sockaddr_to_bytes(&contact.address));
    bytes
}

fn bytes_to_contact<T: AsRef<[u8]>>(bytes: T) -> Result<Contact, DecodeError> {
    let bytes = bytes.as_ref();
    if bytes.len() <= ID_SIZE {
        return Err(DecodeError::InvalidContact(bytes.len()));
    }

    let id = Id::from_bytes(&bytes[..ID_SIZE])?;
    let address = bytes_to_sockaddr(&bytes[ID_SIZE..])?;

    Ok(Contact::new(id, address))
}

fn contacts_to_bytes(contacts: &[Contact]) -> Vec<serde_bytes::ByteBuf> {
    contacts
        .iter()
        .map(|c| serde_bytes::ByteBuf::from(contact_to_bytes(c)))
        .collect()
}

fn bytes_to_contacts(bytes: &[serde_bytes::ByteBuf]) -> Result<Vec<Contact>, DecodeError> {
    bytes.iter().map(bytes_to_contact).collect()
}

fn value_to_serde(entity: &DhtValueEntity) -> internal::DHTValue {
    internal::DHTValue {
        k: entity.primary_key.to_vec(),
        c: contact_to_bytes(&entity.creator),
        value_type: entity.value.value_type.0,
        version: entity.value.version,
        v: entity.value.value.to_vec(),
    }
}

fn value_from_serde(
    value: internal::DHTValue,
    sender: &Contact,
) -> Result<DhtValueEntity, DecodeError> {
    let creator = bytes_to_contact(&value.c)?;

    Ok(DhtValueEntity {
        primary_key: Id::from_bytes(&value.k)?,
        secondary_key: creator.id,
        value: DhtValue {
            value_type: ValueType(value.value_type),
            version: value.version,
            value: value.v.into(),
        },
        creator,
        sender: sender.clone(),
        creation_time: Instant::now(),
        local: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Contact {
        Contact::random("127.0.0.1:6881".parse().unwrap())
            .with_vendor(*b"TEST", 3)
            .with_instance_id(7)
    }

    fn roundtrip(original: Message) {
        let bytes = original.to_bytes().unwrap();
        let parsed = Message::from_bytes(bytes, original.sender.address).unwrap();

        assert_eq!(parsed, original);
        assert!(parsed.sender.same_node(&original.sender));
        assert_eq!(parsed.sender.vendor, original.sender.vendor);
        assert_eq!(parsed.sender.instance_id, original.sender.instance_id);
    }

    #[test]
    fn test_transaction_id() {
        assert_eq!(transaction_id(vec![0, 0, 1, 2]).unwrap(), 258);
        assert!(transaction_id(vec![1, 2]).is_err());
    }

    #[test]
    fn test_ping_request() {
        roundtrip(Message {
            transaction_id: 258,
            version: None,
            sender: sender(),
            message_type: MessageType::Request(RequestSpecific::Ping),
        });
    }

    #[test]
    fn test_pong_response() {
        roundtrip(Message {
            transaction_id: 3,
            version: Some(vec![0xde, 0xad]),
            sender: sender(),
            message_type: MessageType::Response(ResponseSpecific::Pong(PongResponseArguments {
                external_address: Some("[2001:db8::1]:1030".parse().unwrap()),
                estimated_size: 12345,
            })),
        });
    }

    #[test]
    fn test_find_node_response() {
        roundtrip(Message {
            transaction_id: 4,
            version: None,
            sender: sender(),
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    contacts: vec![
                        Contact::random("1.2.3.4:5".parse().unwrap()),
                        Contact::random("[::1]:6".parse().unwrap()),
                    ],
                    token: Some(vec![1, 2, 3, 4]),
                },
            )),
        });
    }

    #[test]
    fn test_find_value_request() {
        roundtrip(Message {
            transaction_id: 5,
            version: None,
            sender: sender(),
            message_type: MessageType::Request(RequestSpecific::FindValue(
                FindValueRequestArguments {
                    target: Id::random(),
                    secondary_keys: vec![Id::random()],
                    value_type: ValueType::TEXT,
                },
            )),
        });
    }

    #[test]
    fn test_store_request_values_carry_creator() {
        let creator = Contact::random("10.0.0.1:2000".parse().unwrap());
        let entity = DhtValueEntity::new(
            creator.clone(),
            Id::random(),
            DhtValue::new(ValueType::BINARY, vec![1, 2, 3]),
            true,
        );

        let message = Message {
            transaction_id: 6,
            version: None,
            sender: sender(),
            message_type: MessageType::Request(RequestSpecific::Store(StoreRequestArguments {
                token: vec![9, 9, 9, 9],
                values: vec![entity.clone()],
            })),
        };

        let parsed = Message::from_bytes(message.to_bytes().unwrap(), message.sender.address)
            .unwrap();

        match parsed.message_type {
            MessageType::Request(RequestSpecific::Store(args)) => {
                assert_eq!(args.values, vec![entity]);
                assert!(args.values[0].creator.same_node(&creator));
                assert!(!args.values[0].local);
                assert_eq!(args.values[0].sender, message.sender);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_store_response() {
        roundtrip(Message {
            transaction_id: 7,
            version: None,
            sender: sender(),
            message_type: MessageType::Response(ResponseSpecific::Store(StoreResponseArguments {
                status: vec![StoreStatusEntry {
                    primary_key: Id::random(),
                    secondary_key: Id::random(),
                    code: StoreStatusCode::BadToken,
                }],
            })),
        });
    }

    #[test]
    fn test_error() {
        roundtrip(Message {
            transaction_id: 8,
            version: None,
            sender: sender(),
            message_type: MessageType::Error(ErrorSpecific {
                code: 203,
                description: "Protocol Error".to_string(),
            }),
        });
    }

    #[test]
    fn malformed_datagrams_are_errors() {
        let from = "127.0.0.1:1".parse().unwrap();

        assert!(Message::from_bytes(b"not bencode", from).is_err());
        assert!(Message::from_bytes(b"d1:t2:aae", from).is_err());
    }
}
