//! End-to-end message flows through a local cluster.

use std::time::Duration;
use tierkv_core::{ClusterConfig, ConcurrencyProtocol, ServerThread};
use tierkv_protocol::{
    Channel, ChannelNetwork, Envelope, ErrorCode, KeyAddressRequest, KeyAddressResponse, Message,
    RequestType, Tier, Transport, TxnRequest, TxnResponse,
};
use tierkv_server::{LocalCluster, TierState};
use tokio::sync::mpsc::{self, UnboundedReceiver};

const CLIENT: &str = "tcp://34.0.9.1:9000";

struct Driver {
    network: std::sync::Arc<ChannelNetwork>,
    inbox: UnboundedReceiver<Envelope>,
    txn_worker: ServerThread,
    next: u32,
}

impl Driver {
    fn new(cluster: &LocalCluster) -> Self {
        let network = cluster.network();
        let (sender, inbox) = mpsc::unbounded_channel();
        network.register(CLIENT, Channel::ClientResponse, sender);
        Self {
            network,
            inbox,
            txn_worker: ServerThread::new("34.0.1.1", "10.0.1.1", 0),
            next: 0,
        }
    }

    async fn receive(&mut self) -> Message {
        let envelope = tokio::time::timeout(Duration::from_secs(5), self.inbox.recv())
            .await
            .expect("no reply within 5s")
            .expect("network closed");
        envelope.message().unwrap()
    }

    async fn call(&mut self, request: TxnRequest) -> TxnResponse {
        self.next += 1;
        let request = request
            .with_request_id(format!("call_{}", self.next))
            .with_response_address(CLIENT);
        let id = request.request_id.clone();
        self.network
            .send(
                &self.txn_worker.txn_request_address(),
                &Message::TxnRequest(request),
            )
            .unwrap();
        let Message::TxnResponse(response) = self.receive().await else {
            panic!("expected a txn response");
        };
        assert_eq!(response.response_id, id);
        response
    }

    async fn start(&mut self, client: &str) -> String {
        let response = self
            .call(TxnRequest::new(RequestType::StartTxn, "").with_tuple(client, ""))
            .await;
        assert_eq!(response.tuples[0].error, ErrorCode::NoError);
        response.txn_id
    }

    async fn put(&mut self, txn: &str, key: &str, value: &str) -> ErrorCode {
        let response = self
            .call(TxnRequest::new(RequestType::TxnPut, txn).with_tuple(key, value))
            .await;
        response.tuples[0].error
    }

    async fn get(&mut self, txn: &str, key: &str) -> (ErrorCode, String) {
        let response = self
            .call(TxnRequest::new(RequestType::TxnGet, txn).with_tuple(key, ""))
            .await;
        (response.tuples[0].error, response.tuples[0].payload.clone())
    }

    async fn commit(&mut self, txn: &str) -> ErrorCode {
        let client = txn.split_once('-').map_or(txn, |(client, _)| client);
        let response = self
            .call(TxnRequest::new(RequestType::CommitTxn, txn).with_tuple(client, ""))
            .await;
        response.error
    }
}

#[tokio::test]
async fn write_commit_then_read() {
    let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
    let mut driver = Driver::new(&cluster);

    let txn = driver.start("alice").await;
    assert!(txn.starts_with("alice-"));
    assert_eq!(driver.put(&txn, "k", "v").await, ErrorCode::NoError);
    assert_eq!(driver.commit(&txn).await, ErrorCode::NoError);

    let reader = driver.start("alice").await;
    assert_eq!(driver.get(&reader, "k").await, (ErrorCode::NoError, "v".to_string()));
    assert_eq!(driver.commit(&reader).await, ErrorCode::NoError);

    let nodes = cluster.shutdown().await;
    let log = nodes
        .iter()
        .find_map(|node| match node.state() {
            TierState::Log(log) => Some(log),
            _ => None,
        })
        .unwrap();
    // prepare and commit of the write; the read-only commit logs its read lock too
    assert!(log.len() >= 2);
    assert_eq!(log.read(0).unwrap().key, "k");
}

#[tokio::test]
async fn conflicting_writers_are_refused() {
    let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
    let mut driver = Driver::new(&cluster);

    let first = driver.start("alice").await;
    let second = driver.start("bob").await;
    assert_eq!(driver.put(&first, "k", "1").await, ErrorCode::NoError);
    assert_eq!(driver.put(&second, "k", "2").await, ErrorCode::FailedOp);

    // The refused write left no lock behind, so its prepare fails and the
    // transaction is aborted.
    assert_eq!(driver.commit(&second).await, ErrorCode::FailedOp);
    assert_eq!(driver.commit(&first).await, ErrorCode::NoError);
    let reader = driver.start("carol").await;
    assert_eq!(driver.get(&reader, "k").await.1, "1");
}

#[tokio::test]
async fn mvcc_refused_write_aborts_the_whole_transaction() {
    let config = ClusterConfig::default().protocol(ConcurrencyProtocol::Mvcc);
    let cluster = LocalCluster::start(config).unwrap();
    let mut driver = Driver::new(&cluster);

    let older = driver.start("alice").await;
    let younger = driver.start("bob").await;
    assert_eq!(driver.get(&younger, "k").await.0, ErrorCode::KeyDne);

    assert_eq!(driver.put(&older, "j", "1").await, ErrorCode::NoError);
    assert_eq!(driver.put(&older, "k", "1").await, ErrorCode::FailedOp);
    assert_eq!(driver.commit(&older).await, ErrorCode::FailedOp);

    // Neither write of the aborted transaction is published.
    let reader = driver.start("carol").await;
    assert_eq!(driver.get(&reader, "j").await.0, ErrorCode::KeyDne);
    assert_eq!(driver.get(&reader, "k").await.0, ErrorCode::KeyDne);
    assert_eq!(driver.commit(&younger).await, ErrorCode::NoError);
}

#[tokio::test]
async fn missing_key_reads_key_dne() {
    let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
    let mut driver = Driver::new(&cluster);
    let txn = driver.start("alice").await;
    assert_eq!(driver.get(&txn, "nothing").await.0, ErrorCode::KeyDne);
}

#[tokio::test]
async fn unknown_transaction_is_rejected() {
    let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
    let mut driver = Driver::new(&cluster);
    driver.start("alice").await;
    assert_eq!(
        driver.put("alice-1:1", "k", "v").await,
        ErrorCode::TxnDne
    );
}

async fn lookup(driver: &mut Driver, routing: &str, key: &str, tier: Tier) -> KeyAddressResponse {
    let request = KeyAddressRequest {
        request_id: format!("lookup_{key}"),
        response_address: CLIENT.to_string(),
        keys: vec![key.to_string()],
        tier,
    };
    driver
        .network
        .send(routing, &Message::KeyAddressRequest(request))
        .unwrap();
    let Message::KeyAddressResponse(response) = driver.receive().await else {
        panic!("expected an address response");
    };
    response
}

#[tokio::test]
async fn routing_tier_follows_membership() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = LocalCluster::start(ClusterConfig::default().disk_root(dir.path())).unwrap();
    let mut driver = Driver::new(&cluster);
    let routing = cluster.routing_addresses()[0].clone();

    let txn_owner = lookup(&mut driver, &routing, "alice", Tier::Txn).await;
    assert_eq!(txn_owner.error, ErrorCode::NoError);
    assert_eq!(
        txn_owner.addresses[0].ips,
        vec![driver.txn_worker.txn_request_address()]
    );

    let before = lookup(&mut driver, &routing, "k", Tier::Memory).await;
    assert_eq!(before.addresses[0].ips.len(), 1);

    let added = cluster.add_node(Tier::Disk).unwrap();
    assert_eq!(added, "10.0.3.1");
    cluster.depart(Tier::Memory, "10.0.2.1").unwrap();

    // Every MEMORY node is gone: keys now resolve to the DISK tier.
    let after = lookup(&mut driver, &routing, "fresh", Tier::Memory).await;
    assert_eq!(
        after.addresses[0].ips,
        vec![ServerThread::new("34.0.3.1", "10.0.3.1", 0).storage_request_address()]
    );
}
