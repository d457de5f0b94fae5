//! Responding to requests from other nodes.

use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{
    self, Contact, FindNodeRequestArguments, FindNodeResponseArguments, FindValueRequestArguments,
    FindValueResponseArguments, MessageType, PongResponseArguments, RequestSpecific,
    ResponseSpecific, SelectMode, StoreRequestArguments, StoreResponseArguments, StoreStatusCode,
    StoreStatusEntry,
};

use super::tokens::Tokens;
use super::Shared;

#[derive(Debug)]
/// Handles PING, FIND_NODE, FIND_VALUE, GET_SECURITY_TOKEN and STORE requests
/// against the shared routing table and database.
pub(crate) struct Server {
    tokens: Tokens,
    k: usize,
}

impl Server {
    pub fn new(k: usize, token_rotate_interval: Duration) -> Self {
        Self {
            tokens: Tokens::new(token_rotate_interval),
            k,
        }
    }

    /// Returns the response to send back to the requester.
    pub fn handle_request(
        &mut self,
        shared: &Shared,
        from: &Contact,
        request: RequestSpecific,
    ) -> MessageType {
        // Lazily rotate secrets before handling a request
        if self.tokens.should_update() {
            self.tokens.rotate()
        }

        MessageType::Response(match request {
            RequestSpecific::Ping => ResponseSpecific::Pong(PongResponseArguments {
                external_address: Some(from.address),
                estimated_size: shared.size() as u64,
            }),
            RequestSpecific::FindNode(FindNodeRequestArguments { target }) => {
                ResponseSpecific::FindNode(FindNodeResponseArguments {
                    contacts: common::read(&shared.routing_table).select(
                        &target,
                        self.k,
                        SelectMode::Alive,
                    ),
                    token: Some(self.token(from)),
                })
            }
            RequestSpecific::FindValue(arguments) => self.find_value(shared, from, arguments),
            RequestSpecific::GetSecurityToken => ResponseSpecific::SecurityToken(self.token(from)),
            RequestSpecific::Store(arguments) => self.store(shared, from, arguments),
        })
    }

    fn token(&self, from: &Contact) -> Vec<u8> {
        self.tokens.generate_token(from.address).to_vec()
    }

    /// Values matching the request, or closer nodes if there are none.
    fn find_value(
        &self,
        shared: &Shared,
        from: &Contact,
        arguments: FindValueRequestArguments,
    ) -> ResponseSpecific {
        let FindValueRequestArguments {
            target,
            secondary_keys,
            value_type,
        } = arguments;

        let values: Vec<_> = common::read(&shared.database)
            .get(&target)
            .into_iter()
            .filter(|entity| secondary_keys.is_empty() || secondary_keys.contains(&entity.secondary_key))
            .filter(|entity| value_type.matches(&entity.value.value_type))
            .collect();

        if values.is_empty() {
            trace!(?target, "No values, returning closer nodes");

            return ResponseSpecific::FindNode(FindNodeResponseArguments {
                contacts: common::read(&shared.routing_table).select(
                    &target,
                    self.k,
                    SelectMode::Alive,
                ),
                token: Some(self.token(from)),
            });
        }

        ResponseSpecific::FindValue(FindValueResponseArguments { values })
    }

    fn store(
        &self,
        shared: &Shared,
        from: &Contact,
        arguments: StoreRequestArguments,
    ) -> ResponseSpecific {
        let StoreRequestArguments { token, values } = arguments;

        let valid = self.tokens.validate(from.address, &token);
        if !valid {
            debug!(?from, "Invalid security token");
        }

        let mut database = common::write(&shared.database);

        let status = values
            .into_iter()
            .map(|mut entity| {
                let code = if valid {
                    entity.sender = from.clone();
                    entity.local = false;

                    database.store(entity.clone())
                } else {
                    StoreStatusCode::BadToken
                };

                StoreStatusEntry {
                    primary_key: entity.primary_key,
                    secondary_key: entity.secondary_key,
                    code,
                }
            })
            .collect();

        ResponseSpecific::Store(StoreResponseArguments { status })
    }
}
