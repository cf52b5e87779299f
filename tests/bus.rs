//! End-to-end tests: a broker thread and tokio member clients over a real socket

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use tempfile::TempDir;
use tokio::time::timeout;

use membus::broker::{Broker, BrokerConfig};
use membus::client::{ClientConfig, MemberClient};
use membus::mux::MuxWaker;
use membus::protocol::{Frame, MemberId, MemberListEvent, MessageId};
use membus::shm::{region_path, RegionLayout, SlotAnnouncement, SlotKind};
use membus::stats::TimingRegistry;
use membus::{ByteBuffer, Error};

/// Message id the tests use to learn that the broker caught up with a member
const SYNC: MessageId = MessageId(200);

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct BrokerFixture {
    dir: TempDir,
    region_id: u32,
    stop: Arc<AtomicBool>,
    waker: MuxWaker,
    handle: Option<JoinHandle<membus::Result<()>>>,
}

impl BrokerFixture {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let layout = RegionLayout::default()
            .slots(SlotKind::Camera, 2, 4096)
            .slots(SlotKind::ProcessedBinary, 2, 1024)
            .slots(SlotKind::TopDown, 2, 1024);
        let config = BrokerConfig::with_socket(dir.path().join("bus.sock"))
            .shm_dir(dir.path())
            .layout(layout)
            .handshake_timeout(Duration::from_secs(2))
            .poll_timeout(Duration::from_millis(20))
            .stats_interval(Duration::from_secs(3600));

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let mut broker = Broker::bind(config)?;
            let _ = tx.send((broker.region_id(), broker.waker()));
            broker.run_until(|| flag.load(Ordering::Acquire))
        });
        let (region_id, waker) = rx.recv().expect("broker failed to start");

        Self {
            dir,
            region_id,
            stop,
            waker,
            handle: Some(handle),
        }
    }

    fn config(&self, member: MemberId) -> ClientConfig {
        ClientConfig::new(member)
            .socket_path(self.dir.path().join("bus.sock"))
            .shm_dir(self.dir.path())
    }

    async fn join(&self, member: MemberId) -> MemberClient {
        MemberClient::connect(self.config(member)).await.unwrap()
    }

    fn shutdown(&mut self) -> membus::Result<()> {
        self.stop.store(true, Ordering::Release);
        self.waker.wake().unwrap();
        self.handle.take().unwrap().join().unwrap()
    }

    /// Wait for the broker thread to exit on its own
    fn wait_for_exit(&mut self, limit: Duration) -> membus::Result<()> {
        let handle = self.handle.take().unwrap();
        let started = Instant::now();
        while !handle.is_finished() {
            assert!(started.elapsed() < limit, "broker kept running");
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.join().unwrap()
    }
}

impl Drop for BrokerFixture {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.store(true, Ordering::Release);
            let _ = self.waker.wake();
            let _ = handle.join();
        }
    }
}

async fn recv(client: &mut MemberClient) -> Frame {
    timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
}

/// Round-trip a frame through the broker; everything this member sent
/// before has been processed once it comes back
async fn sync(client: &mut MemberClient) {
    client.send(SYNC, &b""[..]).await.unwrap();
    loop {
        let frame = recv(client).await;
        if frame.message_id == SYNC && frame.sender_id == client.member_id() {
            return;
        }
    }
}

async fn subscribe(client: &mut MemberClient, ids: &[MessageId]) {
    let mut ids = ids.to_vec();
    ids.push(SYNC);
    client.subscribe(&ids).await.unwrap();
    sync(client).await;
}

#[tokio::test]
async fn test_ping_between_members() {
    let bus = BrokerFixture::start();
    let mut dashboard = bus.join(MemberId::DASHBOARD).await;
    subscribe(&mut dashboard, &[MessageId::PING]).await;

    let mut control = bus.join(MemberId::CONTROL).await;
    assert_eq!(control.region_id(), bus.region_id);
    control.send(MessageId::PING, &b"hello"[..]).await.unwrap();

    let frame = recv(&mut dashboard).await;
    assert_eq!(frame.message_id, MessageId::PING);
    assert_eq!(frame.sender_id, MemberId::CONTROL);
    assert_eq!(&frame.payload[..], b"hello");
}

#[tokio::test]
async fn test_member_list_follows_joins_and_leaves() {
    let bus = BrokerFixture::start();
    let mut observer = bus.join(MemberId::DASHBOARD).await;
    subscribe(&mut observer, &[MessageId::MEMBER_LIST]).await;

    let bridge = bus.join(MemberId::CAN_BRIDGE).await;
    let joined = MemberListEvent::decode(&recv(&mut observer).await.payload).unwrap();
    assert_eq!(
        joined,
        MemberListEvent {
            member: MemberId::CAN_BRIDGE,
            online: true
        }
    );

    bridge.disconnect().await.unwrap();
    let left = recv(&mut observer).await;
    assert_eq!(left.sender_id, MemberId::BROKER);
    assert_eq!(
        MemberListEvent::decode(&left.payload).unwrap(),
        MemberListEvent {
            member: MemberId::CAN_BRIDGE,
            online: false
        }
    );
}

#[tokio::test]
async fn test_reconnect_supersedes_old_connection() {
    let bus = BrokerFixture::start();
    let mut observer = bus.join(MemberId::DASHBOARD).await;
    subscribe(&mut observer, &[MessageId::MEMBER_LIST]).await;

    let mut first = bus.join(MemberId::CAMERA_DRIVER).await;
    let _second = bus.join(MemberId::CAMERA_DRIVER).await;

    let result = timeout(RECV_TIMEOUT, first.recv()).await.unwrap();
    assert!(matches!(result, Err(Error::Disconnected)));

    let mut online = Vec::new();
    for _ in 0..3 {
        let event = MemberListEvent::decode(&recv(&mut observer).await.payload).unwrap();
        assert_eq!(event.member, MemberId::CAMERA_DRIVER);
        online.push(event.online);
    }
    assert_eq!(online, vec![true, false, true]);
}

#[tokio::test]
async fn test_muted_member_is_silenced() {
    let bus = BrokerFixture::start();
    let mut dashboard = bus.join(MemberId::DASHBOARD).await;
    subscribe(&mut dashboard, &[MessageId::PING]).await;
    let mut camera = bus.join(MemberId::CAMERA_DRIVER).await;
    subscribe(&mut camera, &[MessageId::TIMING_SITES]).await;
    let mut control = bus.join(MemberId::CONTROL).await;
    subscribe(&mut control, &[]).await;

    control.mute(&[(MemberId::CAMERA_DRIVER, true)]).await.unwrap();
    sync(&mut control).await;
    camera.send(MessageId::PING, &b"muted"[..]).await.unwrap();
    // A muted member's own sync frame would be dropped too, but the broker
    // answers a timing request on its own behalf
    camera.request_timing_sites().await.unwrap();
    while recv(&mut camera).await.message_id != MessageId::TIMING_SITES {}

    control.mute(&[(MemberId::CAMERA_DRIVER, false)]).await.unwrap();
    sync(&mut control).await;
    camera.send(MessageId::PING, &b"audible"[..]).await.unwrap();

    // Skip the sync traffic of the other members
    let frame = loop {
        let frame = recv(&mut dashboard).await;
        if frame.message_id == MessageId::PING {
            break frame;
        }
    };
    assert_eq!(&frame.payload[..], b"audible");
}

#[tokio::test]
async fn test_large_payload_through_region() {
    let bus = BrokerFixture::start();
    let mut consumer = bus.join(MemberId::DASHBOARD).await;
    subscribe(&mut consumer, &[MessageId::CAMERA_FRAME]).await;
    let consumer_region = consumer.attach_region().unwrap();

    let mut producer = bus.join(MemberId::CAMERA_DRIVER).await;
    let producer_region = producer.attach_region().unwrap();
    assert!(producer_region.is_online(MemberId::DASHBOARD));

    let image: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let sent = producer
        .publish_slot(&producer_region, SlotKind::Camera, &image)
        .await
        .unwrap();

    let frame = recv(&mut consumer).await;
    assert_eq!(frame.message_id, MessageId::CAMERA_FRAME);
    let announcement = SlotAnnouncement::decode(&frame.payload).unwrap();
    assert_eq!(announcement, sent);

    let mut out = ByteBuffer::default();
    consumer_region
        .read_announced(&announcement, &mut out)
        .unwrap();
    assert_eq!(out.as_slice(), &image[..]);
}

#[tokio::test]
async fn test_timing_sites_on_request() {
    let bus = BrokerFixture::start();
    let mut dashboard = bus.join(MemberId::DASHBOARD).await;
    subscribe(&mut dashboard, &[MessageId::TIMING_SITES]).await;

    dashboard.request_timing_sites().await.unwrap();
    let frame = recv(&mut dashboard).await;

    assert_eq!(frame.message_id, MessageId::TIMING_SITES);
    let sites = TimingRegistry::decode(&frame.payload).unwrap();
    assert!(sites.iter().any(|s| s.name == "wait" && s.count > 0));
}

#[test]
fn test_shutdown_removes_socket_and_region() {
    let mut bus = BrokerFixture::start();
    let socket = bus.dir.path().join("bus.sock");
    let region = region_path(bus.dir.path(), bus.region_id);
    assert!(socket.exists());
    assert!(region.exists());

    bus.shutdown().unwrap();

    assert!(!socket.exists());
    assert!(!region.exists());
}

#[test]
fn test_foreign_overrun_stops_broker() {
    let mut bus = BrokerFixture::start();
    let path = region_path(bus.dir.path(), bus.region_id);

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    // SAFETY: test-only mapping of a file this test controls
    let mut rogue = unsafe { MmapMut::map_mut(&file).unwrap() };
    let region = membus::shm::SharedRegion::attach(bus.dir.path(), bus.region_id).unwrap();
    let offset = region.layout().canary_offsets()[1];
    rogue[offset..offset + 8].copy_from_slice(&[0xAA; 8]);
    rogue.flush().unwrap();

    let result = bus.wait_for_exit(Duration::from_secs(5));
    assert!(matches!(result, Err(Error::CanaryViolation { .. })));
}
