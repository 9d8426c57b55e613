//! Link emulation around a [`Qdisc`].
//!
//! The driver plays the role of a network device: it drains an ingress channel into the qdisc,
//! dequeues one packet at a time, and holds the link busy for that packet's transmission time at
//! the configured line rate before handing it to the egress channel.
//!
//! Algorithm:
//! 1. Move everything waiting on the ingress channel into the qdisc.
//! 2. Dequeue one packet; if there is one, forward it and sleep for its serialization delay.
//! 3. Otherwise sleep for the idle poll interval, or less when a shaped flow becomes eligible
//!    sooner.
//! 4. Stop once the running flag is cleared, or once ingress is closed and the qdisc is empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::LinkError;
use crate::packet::{Datagram, Packet};
use crate::scheduler::Qdisc;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Counters kept by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub received: u64,
    pub rejected: u64,
    pub transmitted_packets: u64,
    pub transmitted_bytes: u64,
}

/// Drives a shared qdisc at a fixed line rate.
pub struct LinkDriver<Q> {
    qdisc: Arc<Mutex<Q>>,
    ingress: Receiver<Packet>,
    egress: Sender<Packet>,
    /// Line rate in bytes per second.
    link_rate: u64,
    idle_poll: Duration,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<LinkStats>>,
}

impl<Q> LinkDriver<Q>
where
    Q: Qdisc<Item = Packet> + Send + 'static,
{
    pub fn new(
        qdisc: Arc<Mutex<Q>>,
        ingress: Receiver<Packet>,
        egress: Sender<Packet>,
        link_rate: u64,
    ) -> Result<Self, LinkError> {
        if link_rate == 0 {
            return Err(LinkError::ZeroLinkRate);
        }
        Ok(Self {
            qdisc,
            ingress,
            egress,
            link_rate,
            idle_poll: Duration::from_micros(100),
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(Mutex::new(LinkStats::default())),
        })
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Flag that keeps the driver running; clear it to stop.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Shared handle to the driver's counters.
    pub fn stats(&self) -> Arc<Mutex<LinkStats>> {
        self.stats.clone()
    }

    /// Time the link is busy sending `len` bytes.
    pub fn transmission_time(&self, len: usize) -> Duration {
        let nanos = (len as u128 * NANOS_PER_SEC).div_ceil(self.link_rate as u128);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Move everything queued on ingress into the qdisc.
    ///
    /// # Returns
    /// `false` once the ingress channel is closed and drained
    fn drain_ingress(&self) -> bool {
        let mut qdisc = self.qdisc.lock();
        let mut stats = self.stats.lock();
        loop {
            match self.ingress.try_recv() {
                Ok(packet) => {
                    stats.received += 1;
                    let selector = packet.selector;
                    if !qdisc.enqueue(packet, selector).is_accepted() {
                        stats.rejected += 1;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Run until stopped. Returns the final counters.
    pub async fn run(self) -> Result<LinkStats, LinkError> {
        info!(link_rate = self.link_rate, "link driver started");

        while self.running.load(Ordering::Relaxed) {
            let open = self.drain_ingress();

            // Guard dropped before any await point.
            let (next, empty, wakeup) = {
                let mut qdisc = self.qdisc.lock();
                let packet = qdisc.dequeue();
                (packet, qdisc.is_empty(), qdisc.wakeup_delay())
            };

            match (next, empty) {
                (Some(packet), _) => {
                    let len = packet.len();
                    let busy = self.transmission_time(len);
                    trace!(id = packet.id, len, "transmitting");
                    self.egress
                        .send(packet)
                        .map_err(|_| LinkError::EgressClosed)?;
                    {
                        let mut stats = self.stats.lock();
                        stats.transmitted_packets += 1;
                        stats.transmitted_bytes += len as u64;
                    }
                    tokio::time::sleep(busy).await;
                }
                (None, true) if !open => {
                    debug!("ingress closed and qdisc drained");
                    break;
                }
                (None, _) => {
                    let idle = wakeup.map_or(self.idle_poll, |delay| delay.min(self.idle_poll));
                    tokio::time::sleep(idle).await;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        let stats = *self.stats.lock();
        info!(
            transmitted = stats.transmitted_packets,
            rejected = stats.rejected,
            "link driver stopped"
        );
        Ok(stats)
    }

    /// Run the driver on the current tokio runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<LinkStats, LinkError>> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::band::Band;
    use crate::clock::MonotonicClock;
    use crate::config::{CszConfig, FlowParams, Rate, ShaperConfig};
    use crate::scheduler::{CszScheduler, FlowId, FlowSelector};

    fn scheduler() -> Arc<Mutex<CszScheduler<Packet>>> {
        let config = CszConfig::new(4, 0)
            .with_link_rate(100_000_000)
            .with_flow(1, FlowParams::new(Rate::from_ratio(1, 2), 1 << 20))
            .with_default_flow(FlowParams::new(Rate::from_ratio(1, 4), 1 << 20));
        Arc::new(Mutex::new(
            CszScheduler::new(config, MonotonicClock::new()).unwrap(),
        ))
    }

    #[test]
    fn transmission_time_rounds_up() {
        let (_tx, rx) = crossbeam_channel::unbounded();
        let (etx, _erx) = crossbeam_channel::unbounded();
        let driver = LinkDriver::new(scheduler(), rx, etx, 3).unwrap();
        assert_eq!(driver.transmission_time(1), Duration::from_nanos(333_333_334));
    }

    #[test]
    fn zero_link_rate_is_rejected() {
        let (_tx, rx) = crossbeam_channel::unbounded();
        let (etx, _erx) = crossbeam_channel::unbounded();
        assert!(matches!(
            LinkDriver::new(scheduler(), rx, etx, 0),
            Err(LinkError::ZeroLinkRate)
        ));
    }

    #[tokio::test]
    async fn forwards_every_admitted_packet() {
        let qdisc = scheduler();
        let (tx, rx) = crossbeam_channel::unbounded();
        let (etx, erx) = crossbeam_channel::unbounded();
        let guaranteed = FlowSelector::Guaranteed(FlowId::new(1).unwrap());
        for _ in 0..10 {
            tx.send(Packet::zeroed(guaranteed, 200)).unwrap();
            tx.send(Packet::zeroed(FlowSelector::Default(Band::BestEffortLow), 100))
                .unwrap();
        }
        // Flow 3 is not configured.
        tx.send(Packet::zeroed(
            FlowSelector::Guaranteed(FlowId::new(3).unwrap()),
            100,
        ))
        .unwrap();
        drop(tx);

        let driver = LinkDriver::new(qdisc.clone(), rx, etx, 100_000_000).unwrap();
        let stats = driver.spawn().await.unwrap().unwrap();

        assert_eq!(stats.received, 21);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.transmitted_packets, 20);
        assert_eq!(stats.transmitted_bytes, 3000);
        assert_eq!(erx.try_iter().count(), 20);
        assert!(qdisc.lock().is_empty());
    }

    #[tokio::test]
    async fn idle_sleep_ends_when_shaped_flow_is_eligible() {
        let shaper = ShaperConfig {
            rate: 1000,
            burst: 200,
        };
        let config = CszConfig::new(2, 0)
            .with_link_rate(100_000_000)
            .with_flow(1, FlowParams::new(Rate::ONE, 1 << 20).with_shaper(shaper));
        let qdisc = Arc::new(Mutex::new(
            CszScheduler::new(config, MonotonicClock::new()).unwrap(),
        ));
        let (tx, rx) = crossbeam_channel::unbounded();
        let (etx, erx) = crossbeam_channel::unbounded();
        let shaped = FlowSelector::Guaranteed(FlowId::new(1).unwrap());
        for _ in 0..4 {
            tx.send(Packet::zeroed(shaped, 100)).unwrap();
        }
        drop(tx);

        // Two packets fit the burst, the other two wait 100ms each for tokens.
        let driver = LinkDriver::new(qdisc.clone(), rx, etx, 100_000_000)
            .unwrap()
            .with_idle_poll(Duration::from_secs(10));
        let started = std::time::Instant::now();
        let stats = tokio::time::timeout(Duration::from_secs(2), driver.run())
            .await
            .expect("driver kept sleeping for the full idle poll")
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(stats.transmitted_packets, 4);
        assert_eq!(erx.try_iter().count(), 4);
        assert!(qdisc.lock().is_empty());
    }
}
