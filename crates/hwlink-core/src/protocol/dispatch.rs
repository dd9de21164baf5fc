//! Session state and the dispatch task
//!
//! One task per connection consumes transport events in delivery order,
//! decodes them with the active packet version and routes every frame to a
//! pending wait, the pool, and the broadcast channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::{ConnectionInner, ConnectionState};
use super::legacy::{LegacyCodec, LegacyFrame};
use super::packet::{Frame, PacketType};
use super::pool::{PacketPool, PoolEntry};
use super::transport::TransportEvent;
use super::version::PacketVersion;
use super::wait::WaitCriteria;
use super::{ProtocolError, STATUS_SEQUENCE_NUMBER};

const BROADCAST_CAPACITY: usize = 64;

type Reply = oneshot::Sender<Result<Frame, ProtocolError>>;

struct Waiter {
    id: u64,
    criteria: WaitCriteria,
    reply: Reply,
}

struct SessionState {
    state: ConnectionState,
    working_version: Option<PacketVersion>,
    probe_version: Option<PacketVersion>,
    pool: PacketPool<PacketType, Frame>,
    legacy_pool: PacketPool<u32, LegacyFrame>,
    waiters: Vec<Waiter>,
    closed: bool,
    raw_mode: bool,
    latest_sequence: u16,
}

/// State shared by the dispatch task and every operation on a connection
pub(crate) struct Session {
    state: Mutex<SessionState>,
    next_waiter_id: AtomicU64,
    data_tx: broadcast::Sender<Frame>,
    legacy_data_tx: broadcast::Sender<PoolEntry<LegacyFrame>>,
    ack_tx: broadcast::Sender<LegacyFrame>,
    raw_tx: broadcast::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(raw_mode: bool, pool_limit: usize) -> Self {
        let (data_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (legacy_data_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (ack_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (raw_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (closed_tx, _) = watch::channel(true);

        Self {
            state: Mutex::new(SessionState {
                state: ConnectionState::Disconnected,
                working_version: None,
                probe_version: None,
                pool: PacketPool::with_limit(pool_limit),
                legacy_pool: PacketPool::with_limit(pool_limit),
                waiters: Vec::new(),
                closed: true,
                raw_mode,
                latest_sequence: 0,
            }),
            next_waiter_id: AtomicU64::new(1),
            data_tx,
            legacy_data_tx,
            ack_tx,
            raw_tx,
            closed_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }

    pub(crate) fn working_version(&self) -> Option<PacketVersion> {
        self.lock().working_version
    }

    pub(crate) fn set_working_version(&self, version: Option<PacketVersion>) {
        self.lock().working_version = version;
    }

    /// Version the dispatcher decodes with
    fn active_version(&self) -> PacketVersion {
        let state = self.lock();
        state
            .probe_version
            .or(state.working_version)
            .unwrap_or(PacketVersion::V3)
    }

    /// Switch the probe version, dropping packets decoded with another one
    pub(crate) fn set_probe_version(&self, version: Option<PacketVersion>) {
        let mut state = self.lock();
        if state.probe_version != version {
            state.pool.clear();
            state.legacy_pool.clear();
        }
        state.probe_version = version;
    }

    pub(crate) fn raw_mode(&self) -> bool {
        self.lock().raw_mode
    }

    pub(crate) fn set_raw_mode(&self, raw_mode: bool) {
        self.lock().raw_mode = raw_mode;
    }

    /// Allocate the next command sequence number
    pub(crate) fn allocate_sequence(&self) -> u16 {
        let mut state = self.lock();
        let next = state.latest_sequence.wrapping_add(1);
        state.latest_sequence = if next == 0 || next >= STATUS_SEQUENCE_NUMBER {
            1
        } else {
            next
        };
        state.latest_sequence
    }

    pub(crate) fn latest_sequence(&self) -> u16 {
        self.lock().latest_sequence
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Accept traffic again after the transport was (re)opened
    pub(crate) fn reopen(&self) {
        let mut state = self.lock();
        state.closed = false;
        state.state = match state.working_version {
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Open,
        };
        drop(state);
        self.closed_tx.send_replace(false);
    }

    /// Reject every pending wait and drop pooled packets
    pub(crate) fn close(&self) {
        let waiters = {
            let mut state = self.lock();
            state.closed = true;
            state.state = ConnectionState::Disconnected;
            state.pool.clear();
            state.legacy_pool.clear();
            std::mem::take(&mut state.waiters)
        };
        self.closed_tx.send_replace(true);

        for waiter in waiters {
            let _ = waiter.reply.send(Err(ProtocolError::ConnectionClosed));
        }
    }

    /// Register a wait.
    ///
    /// With `replay` the oldest matching pooled frame satisfies it at once.
    /// Without it every matching pooled frame is discarded: the request the
    /// wait belongs to has not been written yet, so they answer an older one.
    pub(crate) fn register_waiter(
        &self,
        criteria: WaitCriteria,
        replay: bool,
    ) -> Result<(u64, oneshot::Receiver<Result<Frame, ProtocolError>>), ProtocolError> {
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        let mut state = self.lock();
        if state.closed {
            return Err(ProtocolError::ConnectionClosed);
        }

        if !replay {
            let stale = state
                .pool
                .discard(&criteria.packet_types, |frame| criteria.matches(frame));
            if stale > 0 {
                debug!(
                    stale,
                    sequence_number = criteria.sequence_number,
                    "Discarded stale pooled frames"
                );
            }
            state.waiters.push(Waiter { id, criteria, reply });
        } else if let Some(entry) = state
            .pool
            .claim_first(&criteria.packet_types, |frame| criteria.matches(frame))
        {
            debug!(id = %entry.id, "Wait satisfied from pool");
            let _ = reply.send(Ok(entry.packet));
        } else {
            state.waiters.push(Waiter { id, criteria, reply });
        }

        Ok((id, rx))
    }

    /// Remove a pending wait. Returns whether it was still pending.
    pub(crate) fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Route a well-formed v3 frame to the first matching wait or the pool
    fn offer_frame(&self, frame: Frame) {
        let id = Uuid::new_v4();
        let mut state = self.lock();
        let latest = state.latest_sequence;

        state.waiters.retain(|w| !w.reply.is_closed());
        let claimed = state.waiters.iter().enumerate().find_map(|(pos, w)| {
            w.criteria
                .evaluate(&frame, latest)
                .map(|outcome| (pos, outcome))
        });

        match claimed {
            Some((pos, outcome)) => {
                let waiter = state.waiters.remove(pos);
                drop(state);
                debug!(%id, waiter = waiter.id, "Frame claimed by waiter");
                let _ = waiter.reply.send(outcome);
            }
            None if frame.packet_type == PacketType::Error => {
                drop(state);
                warn!(
                    %id,
                    sequence_number = frame.sequence_number,
                    "Unclaimed error frame from device"
                );
            }
            None => {
                let evicted = state.pool.push(frame.packet_type, id, frame.clone());
                drop(state);
                if let Some(evicted) = evicted {
                    debug!(
                        id = %evicted.id,
                        packet_type = ?frame.packet_type,
                        "Pool full, evicted oldest frame"
                    );
                }
            }
        }

        let _ = self.data_tx.send(frame);
    }

    fn pool_legacy(&self, frame: LegacyFrame) {
        let id = Uuid::new_v4();
        let evicted = self
            .lock()
            .legacy_pool
            .push(frame.command_type, id, frame.clone());
        if let Some(evicted) = evicted {
            debug!(
                id = %evicted.id,
                command_type = frame.command_type,
                "Legacy pool full, evicted oldest frame"
            );
        }
        let _ = self.legacy_data_tx.send(PoolEntry::new(id, frame));
    }

    pub(crate) fn get_packets(&self, kinds: &[PacketType]) -> Vec<PoolEntry<Frame>> {
        self.lock().pool.get(kinds)
    }

    pub(crate) fn get_legacy_packets(&self, command_types: &[u32]) -> Vec<PoolEntry<LegacyFrame>> {
        self.lock().legacy_pool.get(command_types)
    }

    pub(crate) fn mark_consumed(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        state.pool.mark_consumed(id) || state.legacy_pool.mark_consumed(id)
    }

    pub(crate) fn subscribe_data(&self) -> broadcast::Receiver<Frame> {
        self.data_tx.subscribe()
    }

    pub(crate) fn subscribe_legacy_data(&self) -> broadcast::Receiver<PoolEntry<LegacyFrame>> {
        self.legacy_data_tx.subscribe()
    }

    pub(crate) fn subscribe_ack(&self) -> broadcast::Receiver<LegacyFrame> {
        self.ack_tx.subscribe()
    }

    pub(crate) fn subscribe_raw(&self) -> broadcast::Receiver<Vec<u8>> {
        self.raw_tx.subscribe()
    }
}

/// Consume transport events until shutdown or the transport goes away
pub(crate) async fn run_dispatcher(
    inner: Arc<ConnectionInner>,
    mut events: mpsc::Receiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    debug!(connection_id = %inner.connection_id, "Dispatcher started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("Dispatcher cancelled");
                break;
            }

            event = events.recv() => match event {
                Some(TransportEvent::Data(bytes)) => inner.dispatch_data(&bytes).await,
                Some(TransportEvent::Closed(reason)) => inner.dispatch_closed(reason),
                None => {
                    inner.dispatch_closed(Some("transport event channel dropped".into()));
                    break;
                }
            }
        }
    }
}

impl ConnectionInner {
    async fn dispatch_data(&self, bytes: &[u8]) {
        self.counters.rx_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        if self.session.raw_mode() {
            let _ = self.session.raw_tx.send(bytes.to_vec());
            return;
        }

        match self.session.active_version() {
            PacketVersion::V3 => self.dispatch_frames(bytes),
            version => self.dispatch_legacy(version, bytes).await,
        }
    }

    fn dispatch_frames(&self, bytes: &[u8]) {
        for frame in self.codec.decode(bytes) {
            self.counters.rx_frames.fetch_add(1, Ordering::Relaxed);

            if !frame.is_valid() {
                self.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!(
                    errors = ?frame.errors,
                    packet_type = ?frame.packet_type,
                    "Dropping malformed frame"
                );
                continue;
            }

            debug!(
                packet_type = ?frame.packet_type,
                sequence_number = frame.sequence_number,
                current = frame.current_packet_number,
                total = frame.total_packet_number,
                "Frame received"
            );
            self.session.offer_frame(frame);
        }
    }

    async fn dispatch_legacy(&self, version: PacketVersion, bytes: &[u8]) {
        let codec = LegacyCodec::new(version);

        for frame in codec.decode(bytes) {
            self.counters.rx_frames.fetch_add(1, Ordering::Relaxed);

            if !self.transport.is_open() {
                debug!("Ignoring legacy frame, connection not open");
                continue;
            }

            if frame.is_info() {
                let _ = self.session.ack_tx.send(frame);
                continue;
            }

            if !frame.is_valid() {
                self.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!(errors = ?frame.errors, "Sending NACK for malformed frame");
                if let Err(e) = self.write_raw(&codec.nack(frame.current_packet_number)).await {
                    error!("Failed to send NACK: {}", e);
                }
                continue;
            }

            if let Err(e) = self.write_raw(&codec.ack(frame.current_packet_number)).await {
                error!("Failed to send ACK: {}", e);
            }
            self.session.pool_legacy(frame);
        }
    }

    fn dispatch_closed(&self, reason: Option<String>) {
        match reason {
            Some(reason) => info!(%reason, "Transport closed"),
            None => info!("Transport closed"),
        }
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_frame(sequence_number: u16) -> Frame {
        Frame::new(1, 1, sequence_number, PacketType::Status, 0, vec![])
    }

    #[test]
    fn test_sequence_allocation_wraps_before_reserved_value() {
        let session = Session::new(false, 4);
        assert_eq!(session.allocate_sequence(), 1);
        assert_eq!(session.allocate_sequence(), 2);
        assert_eq!(session.latest_sequence(), 2);

        session.lock().latest_sequence = STATUS_SEQUENCE_NUMBER - 1;
        assert_eq!(session.allocate_sequence(), 1);
    }

    #[test]
    fn test_register_on_closed_session_fails() {
        let session = Session::new(false, 4);
        let criteria = WaitCriteria::new(&[PacketType::Status], 1);
        assert!(matches!(
            session.register_waiter(criteria, true),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_first_matching_waiter_claims_frame() {
        let session = Session::new(false, 4);
        session.reopen();

        let (_, mut first) = session
            .register_waiter(WaitCriteria::new(&[PacketType::CmdAck], 1), true)
            .unwrap();
        let (_, mut second) = session
            .register_waiter(WaitCriteria::new(&[PacketType::Status], 1), true)
            .unwrap();
        let (_, mut third) = session
            .register_waiter(WaitCriteria::new(&[PacketType::Status], 1), true)
            .unwrap();

        session.offer_frame(status_frame(1));

        assert!(first.try_recv().is_err());
        assert!(matches!(second.try_recv(), Ok(Ok(_))));
        assert!(third.try_recv().is_err());
        assert_eq!(session.waiter_count(), 2);
        assert!(session.get_packets(&[PacketType::Status]).is_empty());
    }

    #[test]
    fn test_unclaimed_frames_are_pooled_and_replayed() {
        let session = Session::new(false, 4);
        session.reopen();

        session.offer_frame(status_frame(9));
        assert_eq!(session.get_packets(&[PacketType::Status]).len(), 1);

        let (_, mut rx) = session
            .register_waiter(WaitCriteria::new(&[PacketType::Status], 3), true)
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(Ok(_))));
        assert!(session.get_packets(&[PacketType::Status]).is_empty());
    }

    #[test]
    fn test_fresh_wait_discards_older_matches() {
        let session = Session::new(false, 4);
        session.reopen();

        session.offer_frame(status_frame(STATUS_SEQUENCE_NUMBER));
        session.offer_frame(Frame::new(1, 1, 3, PacketType::CmdAck, 0, vec![]));
        session.offer_frame(Frame::new(1, 1, 4, PacketType::CmdAck, 0, vec![]));

        let (_, mut rx) = session
            .register_waiter(
                WaitCriteria::new(&[PacketType::Status, PacketType::CmdAck], 3),
                false,
            )
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(session.waiter_count(), 1);

        let left = session.get_packets(&[PacketType::Status, PacketType::CmdAck]);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].packet.sequence_number, 4);
    }

    #[test]
    fn test_pool_is_bounded() {
        let session = Session::new(false, 4);
        session.reopen();
        for _ in 0..10 {
            session.offer_frame(status_frame(STATUS_SEQUENCE_NUMBER));
        }
        assert_eq!(session.get_packets(&[PacketType::Status]).len(), 4);
    }

    #[test]
    fn test_error_frames_are_never_pooled() {
        let session = Session::new(false, 4);
        session.reopen();
        session.offer_frame(Frame::new(1, 1, 1, PacketType::Error, 0, vec![]));
        assert!(session.get_packets(&[PacketType::Error]).is_empty());
    }

    #[test]
    fn test_close_rejects_waiters_and_clears_pool() {
        let session = Session::new(false, 4);
        session.reopen();
        session.offer_frame(status_frame(1));
        let (_, mut rx) = session
            .register_waiter(WaitCriteria::new(&[PacketType::CmdAck], 1), true)
            .unwrap();

        session.close();

        assert!(matches!(rx.try_recv(), Ok(Err(ProtocolError::ConnectionClosed))));
        assert!(session.get_packets(&[PacketType::Status]).is_empty());
        assert!(session.is_closed());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_probe_version_change_clears_pool() {
        let session = Session::new(false, 4);
        session.reopen();
        session.offer_frame(status_frame(1));

        session.set_probe_version(Some(PacketVersion::V3));
        assert!(session.get_packets(&[PacketType::Status]).is_empty());
    }
}
