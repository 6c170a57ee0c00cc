/// UDP intake service: advertises the server and dispatches inbound sensor datagrams
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn, Level};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;

use crate::config::IntakeConfig;
use crate::network::advertisement::Advertisement;
use crate::sink::ReadingSink;
use crate::wire::{DecodeFailure, Decoder};

/// Datagrams longer than this are truncated by the socket and usually fail to decode
pub const RECEIVE_BUFFER_SIZE: usize = 512;

/// Pause after a failed receive so a persistent socket error cannot spin the loop
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to enable broadcast on UDP socket: {0}")]
    Broadcast(#[source] io::Error),
}

/// Owns the intake socket and runs the advertisement and receive loops on it
pub struct IntakeService<S> {
    socket: Arc<UdpSocket>,
    advertisement: Advertisement,
    interval: Duration,
    decoder: Decoder,
    sink: Arc<S>,
    admission: Option<Arc<Semaphore>>,
}

impl<S: ReadingSink> IntakeService<S> {
    /// Bind the configured port with broadcast enabled
    pub async fn bind(config: &IntakeConfig, sink: Arc<S>) -> Result<Self, IntakeError> {
        let addr = config.bind_socket_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| IntakeError::Bind { addr, source })?;
        Self::from_socket(socket, config, sink)
    }

    /// Build the service around an already bound socket
    pub fn from_socket(
        socket: UdpSocket,
        config: &IntakeConfig,
        sink: Arc<S>,
    ) -> Result<Self, IntakeError> {
        socket.set_broadcast(true).map_err(IntakeError::Broadcast)?;

        Ok(IntakeService {
            socket: Arc::new(socket),
            advertisement: Advertisement::from_config(config),
            interval: config.advertisement_interval,
            decoder: Decoder::new(config.schema_revision),
            sink,
            admission: config
                .max_in_flight
                .map(|limit| Arc::new(Semaphore::new(limit.min(Semaphore::MAX_PERMITS)))),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run both loops until `shutdown` resolves
    ///
    /// Handler tasks still running at shutdown are detached, not awaited.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        match self.local_addr() {
            Ok(addr) => info!(
                "Intake service listening on {} (schema revision: {}), advertising to {} every {:?}",
                addr,
                self.decoder.revision(),
                self.advertisement.destination(),
                self.interval
            ),
            Err(e) => warn!("Intake service started, local address unknown: {}", e),
        }

        let mut advertiser = tokio::spawn(advertise(
            Arc::clone(&self.socket),
            self.advertisement,
            self.interval,
            Arc::clone(&self.sink),
        ));
        let mut receiver = tokio::spawn(receive(
            Arc::clone(&self.socket),
            self.decoder,
            Arc::clone(&self.sink),
            self.admission,
        ));

        tokio::select! {
            _ = shutdown => info!("Shutdown requested, stopping intake service"),
            result = &mut advertiser => error!("Advertisement loop exited unexpectedly: {:?}", result),
            result = &mut receiver => error!("Receive loop exited unexpectedly: {:?}", result),
        }

        advertiser.abort();
        receiver.abort();
    }
}

/// Broadcast the advertisement once per interval, starting immediately
async fn advertise<S: ReadingSink>(
    socket: Arc<UdpSocket>,
    advertisement: Advertisement,
    period: Duration,
    sink: Arc<S>,
) {
    let destination = advertisement.destination();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match socket.send_to(advertisement.payload(), destination).await {
            Ok(_) => {
                sink.record_note(
                    &format!("Sent server advertisement to {}", destination),
                    Level::Info,
                )
                .await
            }
            // Usually a transient interface problem; try again next tick
            Err(e) => {
                sink.record_note(
                    &format!("Failed to send server advertisement to {}: {}", destination, e),
                    Level::Warn,
                )
                .await
            }
        }
    }
}

/// Accept datagrams forever, handing each one to its own task
async fn receive<S: ReadingSink>(
    socket: Arc<UdpSocket>,
    decoder: Decoder,
    sink: Arc<S>,
    admission: Option<Arc<Semaphore>>,
) {
    let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];

    loop {
        let (len, from) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP receive error: {}", e);
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };

        let permit = match &admission {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        "Dropping {} byte datagram from {}: too many handlers in flight",
                        len, from
                    );
                    continue;
                }
            },
            None => None,
        };

        let datagram = buffer[..len].to_vec();
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            handle_datagram(&decoder, sink.as_ref(), &datagram, from).await;
            drop(permit);
        });
    }
}

/// Decode one datagram and forward the outcome to the sink
async fn handle_datagram<S: ReadingSink>(
    decoder: &Decoder,
    sink: &S,
    datagram: &[u8],
    from: SocketAddr,
) {
    match decoder.decode(datagram) {
        Ok(reading) => sink.record_structured(reading).await,
        Err(failure @ DecodeFailure::NotOurFormat(_)) => {
            sink.record_note(
                &format!(
                    "Non-protocol datagram received from {} ({} bytes), probably an advertisement: {}",
                    from,
                    datagram.len(),
                    failure
                ),
                failure.level(),
            )
            .await
        }
        Err(failure) => {
            sink.record_note(
                &format!("Discarded datagram from {}: {}", from, failure),
                failure.level(),
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reading;
    use crate::sink::testing::{RecordingSink, SinkEvent};
    use crate::wire::schema::SensorDataMessage;
    use prost::Message;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::{oneshot, Notify};
    use tokio::time::{timeout, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    /// Config that advertises to a loopback listener instead of a real broadcast address
    fn loopback_config(advertisement_port: u16) -> IntakeConfig {
        let mut config = IntakeConfig::with_defaults(advertisement_port, "LIGHTPET_SERVER");
        config.broadcast_addr = Ipv4Addr::LOCALHOST;
        config.bind_addr = Ipv4Addr::LOCALHOST;
        config.advertisement_interval = Duration::from_millis(100);
        config
    }

    async fn listener() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn start<S: ReadingSink>(config: &IntakeConfig, sink: S) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service = IntakeService::from_socket(socket, config, Arc::new(sink)).unwrap();
        let addr = service.local_addr().unwrap();
        tokio::spawn(service.run(std::future::pending()));
        addr
    }

    fn encoded(chip_id: u64, temperature: Vec<i32>) -> Vec<u8> {
        SensorDataMessage {
            timestamp: 1_700_000_000_000,
            temperature_sample_rate: 1,
            temperature_data: temperature,
            chip_id,
            ..Default::default()
        }
        .encode_to_vec()
    }

    async fn next_reading(rx: &mut UnboundedReceiver<SinkEvent>) -> Option<Reading> {
        loop {
            match rx.recv().await? {
                SinkEvent::Reading(reading) => return Some(reading),
                SinkEvent::Note(..) => continue,
            }
        }
    }

    async fn next_note_containing(
        rx: &mut UnboundedReceiver<SinkEvent>,
        needle: &str,
    ) -> Option<(String, Level)> {
        loop {
            match rx.recv().await? {
                SinkEvent::Note(text, level) if text.contains(needle) => {
                    return Some((text, level))
                }
                _ => continue,
            }
        }
    }

    /// Never finishes recording readings from one chip
    struct StallingSink {
        stalled_chip: u64,
        inner: RecordingSink,
    }

    impl ReadingSink for StallingSink {
        async fn record_structured(&self, reading: Reading) {
            if reading.chip_id == self.stalled_chip {
                std::future::pending::<()>().await;
            }
            self.inner.record_structured(reading).await;
        }

        async fn record_note(&self, text: &str, level: Level) {
            self.inner.record_note(text, level).await;
        }
    }

    /// Holds back readings from one chip until the gate is opened
    struct GatedSink {
        gated_chip: u64,
        gate: Arc<Notify>,
        inner: RecordingSink,
    }

    impl ReadingSink for GatedSink {
        async fn record_structured(&self, reading: Reading) {
            if reading.chip_id == self.gated_chip {
                self.gate.notified().await;
            }
            self.inner.record_structured(reading).await;
        }

        async fn record_note(&self, text: &str, level: Level) {
            self.inner.record_note(text, level).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_advertisement_within_one_interval() {
        let listener = listener().await;
        let config = loopback_config(listener.local_addr().unwrap().port());
        let (sink, mut rx) = RecordingSink::new();
        start(&config, sink).await;

        let mut buf = [0u8; 64];
        let (len, _) = timeout(config.advertisement_interval * 2, listener.recv_from(&mut buf))
            .await
            .expect("no advertisement received")
            .unwrap();
        assert_eq!(&buf[..len], b"LIGHTPET_SERVER");

        let (_, level) = timeout(WAIT, next_note_containing(&mut rx, "Sent server advertisement"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level, Level::Info);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn advertisements_keep_their_interval_under_load() {
        let listener = listener().await;
        let config = loopback_config(listener.local_addr().unwrap().port());
        let (sink, _rx) = RecordingSink::new();
        let service_addr = start(&config, sink).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let flood = tokio::spawn(async move {
            for i in 0..400u64 {
                let _ = sender.send_to(&encoded(i, vec![2000]), service_addr).await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let mut buf = [0u8; 64];
        let mut arrivals = Vec::new();
        for _ in 0..5 {
            timeout(WAIT, listener.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            arrivals.push(Instant::now());
        }
        flood.await.unwrap();

        for pair in arrivals.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(60) && gap <= Duration::from_millis(400),
                "advertisement gap {:?}",
                gap
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forwards_decoded_readings() {
        let listener = listener().await;
        let config = loopback_config(listener.local_addr().unwrap().port());
        let (sink, mut rx) = RecordingSink::new();
        let service_addr = start(&config, sink).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&encoded(7, vec![2550]), service_addr)
            .await
            .unwrap();

        let reading = timeout(WAIT, next_reading(&mut rx)).await.unwrap().unwrap();
        assert_eq!(reading.chip_id, 7);
        assert_eq!(reading.temperature_series, vec![25.50]);
        assert_eq!(reading.captured_at.unix_timestamp(), 1_700_000_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn own_advertisement_is_a_low_severity_note() {
        let listener = listener().await;
        let config = loopback_config(listener.local_addr().unwrap().port());
        let (sink, mut rx) = RecordingSink::new();
        let service_addr = start(&config, sink).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(config.advertisement_message.as_bytes(), service_addr)
            .await
            .unwrap();

        let (text, level) = timeout(WAIT, next_note_containing(&mut rx, "Non-protocol datagram"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level, Level::Debug);
        assert!(text.contains("15 bytes"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_handler_does_not_block_reception() {
        let listener = listener().await;
        let config = loopback_config(listener.local_addr().unwrap().port());
        let (inner, mut rx) = RecordingSink::new();
        let sink = StallingSink {
            stalled_chip: 1,
            inner,
        };
        let service_addr = start(&config, sink).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&encoded(1, vec![100]), service_addr)
            .await
            .unwrap();
        sender
            .send_to(&encoded(2, vec![200]), service_addr)
            .await
            .unwrap();

        let reading = timeout(Duration::from_secs(2), next_reading(&mut rx))
            .await
            .expect("second datagram was held up by the stalled handler")
            .unwrap();
        assert_eq!(reading.chip_id, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forwards_back_to_back_datagrams() {
        const COUNT: u64 = 100;

        let listener = listener().await;
        let config = loopback_config(listener.local_addr().unwrap().port());
        let (sink, mut rx) = RecordingSink::new();
        let service_addr = start(&config, sink).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for i in 0..COUNT {
            sender
                .send_to(&encoded(i, vec![i as i32]), service_addr)
                .await
                .unwrap();
        }

        let mut seen = vec![false; COUNT as usize];
        for _ in 0..COUNT {
            let reading = timeout(WAIT, next_reading(&mut rx)).await.unwrap().unwrap();
            seen[reading.chip_id as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forwards_every_datagram_of_a_paced_burst() {
        const COUNT: u64 = 1000;

        let listener = listener().await;
        let config = loopback_config(listener.local_addr().unwrap().port());
        let (sink, mut rx) = RecordingSink::new();
        let service_addr = start(&config, sink).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for i in 0..COUNT {
            sender
                .send_to(&encoded(i, vec![i as i32]), service_addr)
                .await
                .unwrap();
            // The default kernel receive buffer holds only a few hundred small
            // datagrams; pacing keeps the kernel from dropping them before the
            // receive loop ever sees them.
            if i % 50 == 49 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        let mut seen = vec![false; COUNT as usize];
        for _ in 0..COUNT {
            let reading = timeout(WAIT, next_reading(&mut rx)).await.unwrap().unwrap();
            seen[reading.chip_id as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn admission_limit_drops_excess_datagrams() {
        let listener = listener().await;
        let mut config = loopback_config(listener.local_addr().unwrap().port());
        config.max_in_flight = Some(1);
        let (inner, mut rx) = RecordingSink::new();
        let gate = Arc::new(Notify::new());
        let sink = GatedSink {
            gated_chip: 1,
            gate: Arc::clone(&gate),
            inner,
        };
        let service_addr = start(&config, sink).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&encoded(1, vec![100]), service_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Only permit is held by chip 1, so chip 2 is dropped on arrival
        sender
            .send_to(&encoded(2, vec![200]), service_addr)
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(300), next_reading(&mut rx))
            .await
            .is_err());

        gate.notify_one();
        let released = timeout(WAIT, next_reading(&mut rx)).await.unwrap().unwrap();
        assert_eq!(released.chip_id, 1);

        // Permit is returned once the handler task finishes
        tokio::time::sleep(Duration::from_millis(100)).await;
        sender
            .send_to(&encoded(3, vec![300]), service_addr)
            .await
            .unwrap();
        let next = timeout(WAIT, next_reading(&mut rx)).await.unwrap().unwrap();
        assert_eq!(next.chip_id, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn advertisement_loop_survives_send_failures() {
        let mut config = IntakeConfig::with_defaults(9, "LIGHTPET_SERVER");
        config.broadcast_addr = Ipv4Addr::new(10, 0, 0, 255);
        config.advertisement_interval = Duration::from_millis(100);
        let (sink, mut rx) = RecordingSink::new();
        // A loopback-bound socket cannot reach a non-loopback destination
        let service_addr = start(&config, sink).await;

        for _ in 0..2 {
            let (text, level) = timeout(
                WAIT,
                next_note_containing(&mut rx, "Failed to send server advertisement"),
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(level, Level::Warn);
            assert!(text.contains("10.0.0.255:9"));
        }

        // Receive side is unaffected
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&encoded(4, vec![400]), service_addr)
            .await
            .unwrap();
        let reading = timeout(WAIT, next_reading(&mut rx)).await.unwrap().unwrap();
        assert_eq!(reading.chip_id, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_returns_on_shutdown() {
        let listener = listener().await;
        let config = loopback_config(listener.local_addr().unwrap().port());
        let (sink, _rx) = RecordingSink::new();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service = IntakeService::from_socket(socket, &config, Arc::new(sink)).unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let running = tokio::spawn(service.run(async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        timeout(WAIT, running).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config =
            IntakeConfig::with_defaults(taken.local_addr().unwrap().port(), "LIGHTPET_SERVER");
        config.bind_addr = Ipv4Addr::LOCALHOST;
        let (sink, _rx) = RecordingSink::new();

        let result = IntakeService::bind(&config, Arc::new(sink)).await;
        assert!(matches!(result, Err(IntakeError::Bind { .. })));
    }
}
