//! AsyncDht node.

use crate::{
    actor::{ActorMessage, Info},
    common::{Contact, DhtValue, Id, ValueKey},
    core::{
        BootstrapResult, BootstrapSeed, DhtResult, FindValueResult, NodeLookupResult, PingTarget,
        StoreResult,
    },
    dht::Dht,
    error::DhtError,
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Returns a reference to the wrapped [Dht].
    pub fn as_sync(&self) -> &Dht {
        &self.0
    }

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtError> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
            .sender()
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtError::Closed)?;

        receiver.recv_async().await.map_err(|_| DhtError::Closed)
    }

    pub fn local_contact(&self) -> &Contact {
        self.0.local_contact()
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub fn is_booting(&self) -> bool {
        self.0.is_booting()
    }

    pub fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    // === Public Methods ===

    /// Close the node without blocking on the actor thread.
    pub async fn close(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        if self.0.sender().send(ActorMessage::Close(sender)).is_ok() {
            let _ = receiver.recv_async().await;
        }
    }

    pub async fn bootstrap(&self, seed: impl Into<BootstrapSeed>) -> DhtResult<BootstrapResult> {
        self.0.bootstrap(seed).wait_async().await
    }

    pub async fn ping(&self, target: impl Into<PingTarget>) -> DhtResult<Contact> {
        self.0.ping(target).wait_async().await
    }

    pub async fn lookup(&self, target: Id) -> DhtResult<NodeLookupResult> {
        self.0.lookup(target).wait_async().await
    }

    pub async fn get(&self, key: impl Into<ValueKey>) -> DhtResult<FindValueResult> {
        self.0.get(key).wait_async().await
    }

    pub async fn put(&self, key: Id, value: DhtValue) -> DhtResult<StoreResult> {
        self.0.put(key, value).wait_async().await
    }

    pub async fn enqueue(&self, key: Id, value: DhtValue) -> DhtResult<StoreResult> {
        self.0.enqueue(key, value).wait_async().await
    }

    pub async fn remove(&self, key: Id) -> DhtResult<StoreResult> {
        self.0.remove(key).wait_async().await
    }
}

#[cfg(test)]
mod test {
    use crate::common::ValueType;
    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn close() {
        async fn test() {
            let testnet = Testnet::new(2).unwrap();

            let dht = Dht::new(testnet.node_config()).unwrap().as_async();

            let a = dht.clone();

            dht.close().await;

            let result = a.get(Id::random()).await;

            assert!(matches!(result, Err(DhtError::Closed)));
            assert!(matches!(a.info().await, Err(DhtError::Closed)));
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn put_get() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::new(testnet.node_config()).unwrap().as_async();
            let b = Dht::new(testnet.node_config()).unwrap().as_async();

            a.bootstrap(testnet.bootstrap[0]).await.unwrap();
            b.bootstrap(testnet.bootstrap[3]).await.unwrap();

            let key = Id::hash(b"Hello World!");
            let value = DhtValue::new(ValueType::BINARY, &b"Hello World!"[..]);

            let stored = a.put(key, value.clone()).await.unwrap();
            assert!(stored.is_stored());

            let found = b.get(key).await.unwrap();
            assert!(found.found);
            assert_eq!(found.entities[0].value, value);

            a.as_sync().close();
            b.as_sync().close();
        }

        futures::executor::block_on(test());
    }
}
