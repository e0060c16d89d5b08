// connection.rs - Implicit (Class-1) connection manager
//
// A connection is negotiated with Forward Open against the Connection
// Manager object (class 6, instance 1), exchanged cyclically over UDP
// port 2222, and torn down with Forward Close. The UDP socket is bound
// once per engine and shared by every connection; a demultiplexer task
// routes inbound frames to the owning connection by source address and
// T->O connection id. Each open connection additionally runs an O->T
// sender and a watchdog that detects T->O silence. Tasks cooperate
// through the shared connection record and stop on a shared signal,
// joined before resources are freed.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::assembly;
use crate::bytes::Reader;
use crate::cip::{
    self, PathSegment, FORWARD_CLOSE, FORWARD_OPEN, ITEM_CONNECTED_ADDRESS, ITEM_CONNECTED_DATA,
    ITEM_SEQUENCED_ADDRESS,
};
use crate::encap::IMPLICIT_PORT;
use crate::error::{EipError, Result};
use crate::session::Session;

/// Size of the implicit connection table.
pub const MAX_CONNECTIONS: usize = 8;
/// Accepted requested-packet-interval range, milliseconds.
pub const MIN_RPI_MS: u32 = 10;
pub const MAX_RPI_MS: u32 = 10_000;

/// Vendor id this originator reports in Forward Open.
const ORIGINATOR_VENDOR_ID: u16 = 0x1337;
/// Priority/tick-time and timeout-ticks carried in Forward Open and
/// echoed unchanged in Forward Close.
const PRIORITY_TICK_TIME: u8 = 0x0A;
const TIMEOUT_TICKS: u8 = 0x0F;
/// Connection timeout multiplier code: timeout = RPI * 2^(code + 2).
const TIMEOUT_MULTIPLIER: u8 = 0x02;
/// Transport class/trigger: class 1, cyclic.
const TRANSPORT_CLASS1_CYCLIC: u8 = 0x01;
/// 32-bit run/idle header marking produced data as Run.
const RUN_IDLE_RUN: u32 = 0x0000_0001;
/// Extended status: target disagrees with the negotiated connection size.
const EXT_STATUS_INVALID_SIZE: u16 = 0x0315;
/// Base for the multicast-style connection-id pair proposed on shared
/// (non-exclusive-owner) connections; the target's echoed ids win anyway.
const SHARED_ID_BASE: u32 = 0xF800_0000;

/// The sender never paces slower than this, regardless of RPI.
const MAX_SENDER_PERIOD_MS: u32 = 1000;
/// Watchdog polling period.
const WATCHDOG_PERIOD: Duration = Duration::from_millis(100);
/// Bounded wait for the output buffer; on contention the cycle sends
/// zeros instead of blocking.
const OUTPUT_LOCK_WAIT: Duration = Duration::from_millis(5);
/// Depth of the T->O delivery queue handed to the consumer.
const INPUT_QUEUE_DEPTH: usize = 64;
/// How long teardown waits for each task to exit.
const TASK_JOIN_WAIT: Duration = Duration::from_secs(2);
/// Cap on waiting out the adapter's own timeout after an unacknowledged
/// Forward Close.
const MAX_LINGER: Duration = Duration::from_secs(10);

/// Lifecycle of an implicit connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Opening,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Idle,
        }
    }
}

/// Parameters for opening an implicit connection.
#[derive(Debug, Clone)]
pub struct ImplicitConfig {
    pub target: Ipv4Addr,
    /// Assembly instance the adapter consumes (O->T data).
    pub consumed_instance: u16,
    /// Assembly instance the adapter produces (T->O data).
    pub produced_instance: u16,
    /// O->T data size in bytes; auto-detected from the consumed assembly
    /// when `None`.
    pub consumed_size: Option<usize>,
    /// T->O data size in bytes; auto-detected when `None`.
    pub produced_size: Option<usize>,
    pub rpi_ms: u32,
    /// Exclusive owner uses pseudo-random point-to-point connection ids;
    /// a shared connection proposes the reserved multicast-style pair.
    pub exclusive_owner: bool,
}

/// State shared between the connection's tasks and the engine.
pub(crate) struct ConnShared {
    state: AtomicU8,
    valid: AtomicBool,
    epoch: Instant,
    // Millisecond timestamps relative to `epoch`, offset by one so that
    // zero means "never".
    first_send_ms: AtomicU64,
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    /// O->T output image; always exactly the consumed size.
    output: Mutex<Vec<u8>>,
}

impl ConnShared {
    fn new(output: Vec<u8>) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Opening as u8),
            valid: AtomicBool::new(true),
            epoch: Instant::now(),
            first_send_ms: AtomicU64::new(0),
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            output: Mutex::new(output),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn touch_send(&self) {
        let now = self.now_ms();
        self.last_send_ms.store(now, Ordering::Relaxed);
        let _ = self
            .first_send_ms
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed);
    }

    fn touch_recv(&self) {
        self.last_recv_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    /// Marks the connection dead; the tasks observe this at the top of
    /// their loop and exit, and the demultiplexer stops routing to it.
    fn invalidate(&self) {
        self.set_state(ConnectionState::Closing);
        self.valid.store(false, Ordering::Relaxed);
    }
}

/// Forward Open parameters; the id/serial fields must be echoed unchanged
/// in Forward Close.
#[derive(Debug, Clone)]
pub(crate) struct ForwardOpenParams {
    pub o_to_t_id: u32,
    pub t_to_o_id: u32,
    pub connection_serial: u16,
    pub originator_serial: u32,
    pub rpi_us: u32,
    pub consumed_size: usize,
    pub produced_size: usize,
    pub consumed_instance: u16,
    pub produced_instance: u16,
    pub exclusive_owner: bool,
}

/// Generates connection ids and serial numbers. The counter keeps
/// concurrently generated ids distinct even when the random salt collides.
pub(crate) struct ConnectionIdGen {
    counter: StdMutex<u32>,
}

impl ConnectionIdGen {
    pub fn new() -> Self {
        Self {
            counter: StdMutex::new(1),
        }
    }

    fn next_counter(&self) -> u32 {
        let mut counter = match self.counter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counter = counter.wrapping_add(1);
        *counter
    }

    /// Pseudo-random id pair for an exclusive point-to-point connection.
    pub fn point_to_point_pair(&self) -> (u32, u32) {
        let count = self.next_counter();
        let o_to_t = ((rand::random::<u16>() as u32) << 16) | (count & 0xFFFF);
        let t_to_o = ((rand::random::<u16>() as u32) << 16) | (count.wrapping_add(1) & 0xFFFF);
        (o_to_t, t_to_o)
    }

    /// Reserved multicast-style pair proposed on shared connections.
    pub fn shared_pair(connection_serial: u16) -> (u32, u32) {
        (
            SHARED_ID_BASE | connection_serial as u32,
            SHARED_ID_BASE | 0x0001_0000 | connection_serial as u32,
        )
    }

    pub fn connection_serial(&self) -> u16 {
        rand::random()
    }

    pub fn originator_serial(&self) -> u32 {
        rand::random()
    }
}

/// How the negotiated size fields are interpreted. Adapters disagree on
/// whether the 32-bit run/idle header and the sequence count are part of
/// the size, so Forward Open retries through these on extended status
/// 0x0315.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeMode {
    /// Data plus protocol overhead (run/idle + sequence count).
    WithOverhead,
    /// Data bytes only.
    DataOnly,
    /// Data bytes only, fixed-length framing.
    DataOnlyFixed,
}

const SIZE_MODES: [SizeMode; 3] = [
    SizeMode::WithOverhead,
    SizeMode::DataOnly,
    SizeMode::DataOnlyFixed,
];

fn o_to_t_wire_size(mode: SizeMode, data_size: usize) -> u16 {
    match mode {
        // 2-byte CIP sequence + 4-byte run/idle header
        SizeMode::WithOverhead => (data_size + 6) as u16,
        _ => data_size as u16,
    }
}

fn t_to_o_wire_size(mode: SizeMode, data_size: usize) -> u16 {
    match mode {
        // 2-byte CIP sequence
        SizeMode::WithOverhead => (data_size + 2) as u16,
        _ => data_size as u16,
    }
}

/// Network connection parameter word: size in the low 9 bits, then
/// variable-size, priority and connection-type bits.
fn network_params(size: u16, multicast: bool, variable: bool) -> u16 {
    let mut word = size & 0x01FF;
    word |= 0x0400; // high priority
    word |= if multicast { 0x2000 } else { 0x4000 };
    if variable {
        word |= 0x0200;
    }
    word
}

fn connection_manager_path() -> Vec<PathSegment> {
    vec![PathSegment::Class(6), PathSegment::Instance(1)]
}

/// Connection path naming both assembly instances as connection points.
fn connection_path(params: &ForwardOpenParams) -> Vec<u8> {
    cip::encode_path(&[
        PathSegment::Class(assembly::ASSEMBLY_CLASS),
        PathSegment::ConnectionPoint(params.consumed_instance),
        PathSegment::ConnectionPoint(params.produced_instance),
    ])
}

fn build_forward_open(params: &ForwardOpenParams, mode: SizeMode) -> Result<Vec<u8>> {
    let variable = mode != SizeMode::DataOnlyFixed;
    let path = connection_path(params);

    let mut payload = Vec::with_capacity(36 + path.len());
    payload.push(PRIORITY_TICK_TIME);
    payload.push(TIMEOUT_TICKS);
    payload.extend_from_slice(&params.o_to_t_id.to_le_bytes());
    payload.extend_from_slice(&params.t_to_o_id.to_le_bytes());
    payload.extend_from_slice(&params.connection_serial.to_le_bytes());
    payload.extend_from_slice(&ORIGINATOR_VENDOR_ID.to_le_bytes());
    payload.extend_from_slice(&params.originator_serial.to_le_bytes());
    payload.push(TIMEOUT_MULTIPLIER);
    payload.extend_from_slice(&[0x00, 0x00, 0x00]); // reserved
    payload.extend_from_slice(&params.rpi_us.to_le_bytes());
    payload.extend_from_slice(
        &network_params(o_to_t_wire_size(mode, params.consumed_size), false, variable)
            .to_le_bytes(),
    );
    payload.extend_from_slice(&params.rpi_us.to_le_bytes());
    payload.extend_from_slice(
        &network_params(
            t_to_o_wire_size(mode, params.produced_size),
            !params.exclusive_owner,
            variable,
        )
        .to_le_bytes(),
    );
    payload.push(TRANSPORT_CLASS1_CYCLIC);
    payload.push((path.len() / 2) as u8);
    payload.extend_from_slice(&path);

    cip::encode_request(FORWARD_OPEN, &connection_manager_path(), &payload)
}

fn build_forward_close(params: &ForwardOpenParams) -> Result<Vec<u8>> {
    let path = connection_path(params);

    let mut payload = Vec::with_capacity(12 + path.len());
    payload.push(PRIORITY_TICK_TIME);
    payload.push(TIMEOUT_TICKS);
    payload.extend_from_slice(&params.connection_serial.to_le_bytes());
    payload.extend_from_slice(&ORIGINATOR_VENDOR_ID.to_le_bytes());
    payload.extend_from_slice(&params.originator_serial.to_le_bytes());
    payload.push((path.len() / 2) as u8);
    payload.push(0x00); // reserved
    payload.extend_from_slice(&path);

    cip::encode_request(FORWARD_CLOSE, &connection_manager_path(), &payload)
}

/// Parses a successful Forward Open reply: the echoed connection ids are
/// authoritative and may differ from the proposed ones.
fn parse_forward_open_reply(data: &[u8]) -> Result<(u32, u32)> {
    let mut r = Reader::new(data);
    let o_to_t_id = r.u32_le()?;
    let t_to_o_id = r.u32_le()?;
    r.skip(2)?; // connection serial echo
    r.skip(2)?; // vendor echo
    r.skip(4)?; // originator serial echo
    r.skip(4)?; // O->T actual packet interval
    r.skip(4)?; // T->O actual packet interval
    Ok((o_to_t_id, t_to_o_id))
}

/// Negotiates Forward Open, retrying through the size interpretations on
/// extended status 0x0315. Any other non-zero status is terminal.
async fn forward_open(session: &mut Session, params: &ForwardOpenParams) -> Result<(u32, u32)> {
    for (attempt, mode) in SIZE_MODES.iter().enumerate() {
        let request = build_forward_open(params, *mode)?;
        let reply = session.send_rr_data(&request).await?;
        if reply.general_status == 0 {
            let ids = parse_forward_open_reply(&reply.data)?;
            debug!(
                o_to_t = format_args!("0x{:08X}", ids.0),
                t_to_o = format_args!("0x{:08X}", ids.1),
                ?mode,
                "forward open accepted"
            );
            return Ok(ids);
        }
        let invalid_size = reply.extended_status.first() == Some(&EXT_STATUS_INVALID_SIZE);
        if invalid_size && attempt + 1 < SIZE_MODES.len() {
            debug!(?mode, "forward open rejected the connection size, retrying");
            continue;
        }
        return Err(EipError::cip_status(
            reply.general_status,
            &reply.extended_status,
        ));
    }
    unreachable!("size-mode retry loop always returns")
}

/// Sends Forward Close and checks the reply status.
async fn forward_close(session: &mut Session, params: &ForwardOpenParams) -> Result<()> {
    let request = build_forward_close(params)?;
    let reply = session.send_rr_data(&request).await?;
    reply.check_status()
}

/// The adapter considers the connection dead this long after the last
/// O->T packet.
fn adapter_timeout(rpi_ms: u32) -> Duration {
    Duration::from_millis(rpi_ms as u64 * (1 << (TIMEOUT_MULTIPLIER as u32 + 2)))
}

/// Builds one O->T cyclic frame: sequenced address item carrying the
/// connection id and a 32-bit sequence, then a connected data item with
/// the 16-bit CIP sequence, the run/idle header and the output image.
fn build_o_to_t_frame(conn_id: u32, sequence: u32, cip_sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + data.len());
    out.extend_from_slice(&2u16.to_le_bytes()); // item count
    out.extend_from_slice(&ITEM_SEQUENCED_ADDRESS.to_le_bytes());
    out.extend_from_slice(&8u16.to_le_bytes());
    out.extend_from_slice(&conn_id.to_le_bytes());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&ITEM_CONNECTED_DATA.to_le_bytes());
    out.extend_from_slice(&((2 + 4 + data.len()) as u16).to_le_bytes());
    out.extend_from_slice(&cip_sequence.to_le_bytes());
    out.extend_from_slice(&RUN_IDLE_RUN.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Splits a T->O frame into its connection id and data-item body.
/// Accepts a sequenced or connected address item; anything else, or a
/// missing connected-data item, is not a cyclic frame.
fn split_t_to_o_frame(frame: &[u8]) -> Option<(u32, &[u8])> {
    let mut r = Reader::new(frame);
    let item_count = r.u16_le().ok()?;
    if item_count < 2 {
        return None;
    }
    let addr_type = r.u16_le().ok()?;
    let addr_len = r.u16_le().ok()? as usize;
    let conn_id = match (addr_type, addr_len) {
        (ITEM_SEQUENCED_ADDRESS, 8) => {
            let id = r.u32_le().ok()?;
            r.skip(4).ok()?; // encapsulation sequence
            id
        }
        (ITEM_CONNECTED_ADDRESS, 4) => r.u32_le().ok()?,
        _ => return None,
    };
    let data_type = r.u16_le().ok()?;
    if data_type != ITEM_CONNECTED_DATA {
        return None;
    }
    let data_len = r.u16_le().ok()? as usize;
    let body = r.take(data_len).ok()?;
    Some((conn_id, body))
}

/// Validates the data-item body against the negotiated produced size.
/// Class-1 framing carries a 16-bit CIP sequence before the data; Class-0
/// carries the bare data. Any other length is discarded.
fn extract_produced(body: &[u8], produced_size: usize) -> Option<Vec<u8>> {
    if body.len() == 2 + produced_size {
        Some(body[2..].to_vec())
    } else if body.len() == produced_size {
        Some(body.to_vec())
    } else {
        None
    }
}

pub(crate) fn watchdog_threshold_ms(rpi_ms: u32) -> u64 {
    (20 * rpi_ms as u64).max(10_000)
}

/// T->O silence check. Requires at least one prior send; silence is
/// measured from the last received frame, or from the first send when
/// nothing has ever arrived.
pub(crate) fn watchdog_expired(
    first_send_ms: u64,
    last_recv_ms: u64,
    now_ms: u64,
    threshold_ms: u64,
) -> bool {
    if first_send_ms == 0 {
        return false;
    }
    let base = if last_recv_ms != 0 {
        last_recv_ms
    } else {
        first_send_ms
    };
    now_ms.saturating_sub(base) > threshold_ms
}

/// Copies `data` into the output image, zero-padding the remainder. The
/// image length never changes.
pub(crate) fn copy_zero_padded(image: &mut [u8], data: &[u8]) {
    image[..data.len()].copy_from_slice(data);
    image[data.len()..].fill(0);
}

/// Frame routing state for one connection on the shared I/O socket.
struct Route {
    shared: Arc<ConnShared>,
    produced_size: usize,
    delivery: mpsc::Sender<Vec<u8>>,
}

type RouteKey = (Ipv4Addr, u32);
type RouteTable = Arc<StdMutex<HashMap<RouteKey, Route>>>;

fn lock_routes(routes: &StdMutex<HashMap<RouteKey, Route>>) -> std::sync::MutexGuard<'_, HashMap<RouteKey, Route>> {
    match routes.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Engine-wide implicit I/O endpoint: the UDP socket is bound once to
/// the fixed port and shared by every connection, so the connection
/// table can actually fill all its slots.
#[derive(Clone)]
struct IoHub {
    socket: Arc<UdpSocket>,
    routes: RouteTable,
}

/// Receives every inbound implicit frame and routes it to the owning
/// connection by (source address, T->O connection id). Frames with no
/// route, a dead route, or an inconsistent length are discarded.
async fn demux_task(socket: Arc<UdpSocket>, routes: RouteTable) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                trace!(error = %e, "cyclic receive failed");
                sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        let source = match from {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => continue,
        };
        let (conn_id, body) = match split_t_to_o_frame(&buf[..len]) {
            Some(parts) => parts,
            None => continue,
        };
        let (shared, delivery, produced_size) = {
            let routes = lock_routes(&routes);
            match routes.get(&(source, conn_id)) {
                Some(route) => (
                    route.shared.clone(),
                    route.delivery.clone(),
                    route.produced_size,
                ),
                None => continue,
            }
        };
        if !shared.is_valid() {
            continue;
        }
        if let Some(payload) = extract_produced(body, produced_size) {
            shared.touch_recv();
            if delivery.try_send(payload).is_err() {
                trace!("input queue full, T->O frame dropped");
            }
        }
    }
}

async fn sender_task(
    shared: Arc<ConnShared>,
    mut stop: watch::Receiver<bool>,
    udp: Arc<UdpSocket>,
    target: SocketAddrV4,
    conn_id: u32,
    consumed_size: usize,
    rpi_ms: u32,
) {
    let period = Duration::from_millis(rpi_ms.min(MAX_SENDER_PERIOD_MS) as u64);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence: u32 = 0;
    let mut cip_sequence: u16 = 0;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        if !shared.is_valid() {
            break;
        }
        let data = match timeout(OUTPUT_LOCK_WAIT, shared.output.lock()).await {
            Ok(guard) => guard.clone(),
            // Contention must not stall the cycle.
            Err(_) => vec![0u8; consumed_size],
        };
        sequence = sequence.wrapping_add(1);
        cip_sequence = cip_sequence.wrapping_add(1);
        let frame = build_o_to_t_frame(conn_id, sequence, cip_sequence, &data);
        match udp.send_to(&frame, SocketAddr::V4(target)).await {
            Ok(_) => shared.touch_send(),
            Err(e) => trace!(error = %e, "cyclic send failed"),
        }
    }
    trace!("O->T sender stopped");
}

async fn watchdog_task(shared: Arc<ConnShared>, mut stop: watch::Receiver<bool>, threshold_ms: u64) {
    let mut ticker = interval(WATCHDOG_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        if !shared.is_valid() {
            break;
        }
        // A stalled sender is not itself cause for teardown; only T->O
        // silence is.
        let first_send = shared.first_send_ms.load(Ordering::Relaxed);
        let last_recv = shared.last_recv_ms.load(Ordering::Relaxed);
        if watchdog_expired(first_send, last_recv, shared.now_ms(), threshold_ms) {
            warn!(
                threshold_ms,
                "no T->O frame within the silence window, tearing down connection"
            );
            shared.invalidate();
            break;
        }
    }
    trace!("watchdog stopped");
}

/// One claimed connection-table slot.
struct ConnectionSlot {
    target: Ipv4Addr,
    shared: Arc<ConnShared>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    /// Control session, held for the connection's entire lifetime.
    session: Option<Session>,
    params: ForwardOpenParams,
    route_key: RouteKey,
    rpi_ms: u32,
    consumed_size: usize,
}

enum SlotEntry {
    /// Slot claimed while Forward Open is in flight.
    Pending(Ipv4Addr),
    Active(ConnectionSlot),
    /// Slot held while teardown runs, so a concurrent open to the same
    /// target is rejected instead of racing the close.
    Closing(Ipv4Addr),
}

struct ConnectionTable {
    slots: Vec<Option<SlotEntry>>,
}

impl ConnectionTable {
    fn new() -> Self {
        Self {
            slots: (0..MAX_CONNECTIONS).map(|_| None).collect(),
        }
    }
}

/// The implicit connection manager: a fixed-size table keyed by target
/// address, at most one connection per target.
pub(crate) struct ConnectionManager {
    table: Mutex<ConnectionTable>,
    id_gen: ConnectionIdGen,
    local_address: Ipv4Addr,
    connect_timeout: Duration,
    io_timeout: Duration,
    io: Mutex<Option<IoHub>>,
}

impl ConnectionManager {
    pub fn new(local_address: Ipv4Addr, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(ConnectionTable::new()),
            id_gen: ConnectionIdGen::new(),
            local_address,
            connect_timeout,
            io_timeout,
            io: Mutex::new(None),
        }
    }

    /// The shared I/O socket and route table, bound on first use and kept
    /// for the engine's lifetime.
    async fn io_hub(&self) -> Result<IoHub> {
        let mut io = self.io.lock().await;
        if let Some(hub) = io.as_ref() {
            return Ok(hub.clone());
        }
        let socket = Arc::new(UdpSocket::bind((self.local_address, IMPLICIT_PORT)).await?);
        let routes: RouteTable = Arc::new(StdMutex::new(HashMap::new()));
        tokio::spawn(demux_task(socket.clone(), routes.clone()));
        debug!(port = IMPLICIT_PORT, "implicit I/O socket bound");
        let hub = IoHub { socket, routes };
        *io = Some(hub.clone());
        Ok(hub)
    }

    async fn remove_route(&self, key: RouteKey) {
        if let Some(hub) = self.io.lock().await.as_ref() {
            lock_routes(&hub.routes).remove(&key);
        }
    }

    /// Opens an implicit connection and returns the T->O delivery queue.
    pub async fn open(&self, config: ImplicitConfig) -> Result<mpsc::Receiver<Vec<u8>>> {
        if !(MIN_RPI_MS..=MAX_RPI_MS).contains(&config.rpi_ms) {
            return Err(EipError::InvalidRpi(config.rpi_ms));
        }

        // Claim a slot first so concurrent opens cannot race past the
        // capacity or per-target checks.
        let slot_index = {
            let mut table = self.table.lock().await;
            for entry in table.slots.iter().flatten() {
                match entry {
                    SlotEntry::Pending(target) | SlotEntry::Closing(target)
                        if *target == config.target =>
                    {
                        return Err(EipError::AlreadyOpen(config.target));
                    }
                    SlotEntry::Active(slot)
                        if slot.target == config.target && slot.shared.is_valid() =>
                    {
                        return Err(EipError::AlreadyOpen(config.target));
                    }
                    _ => {}
                }
            }
            // Prefer reclaiming a dead slot for the same target.
            let reclaim = table.slots.iter().position(|entry| {
                matches!(entry, Some(SlotEntry::Active(slot))
                    if slot.target == config.target && !slot.shared.is_valid())
            });
            let index = match reclaim.or_else(|| table.slots.iter().position(Option::is_none)) {
                Some(index) => index,
                None => return Err(EipError::NoFreeSlot(MAX_CONNECTIONS)),
            };
            if let Some(SlotEntry::Active(stale)) = table.slots[index].take() {
                // Its tasks have already exited; drop handles and route.
                for task in stale.tasks {
                    task.abort();
                }
                self.remove_route(stale.route_key).await;
            }
            table.slots[index] = Some(SlotEntry::Pending(config.target));
            index
        };

        match self.bring_up(&config).await {
            Ok((slot, delivery)) => {
                let mut table = self.table.lock().await;
                table.slots[slot_index] = Some(SlotEntry::Active(slot));
                Ok(delivery)
            }
            Err(e) => {
                let mut table = self.table.lock().await;
                table.slots[slot_index] = None;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        session: &mut Session,
        config: &ImplicitConfig,
    ) -> Result<ForwardOpenParams> {
        // Unsupplied sizes are resolved by reading the assembly; a failed
        // probe is a hard failure, never a fallback to zero.
        let consumed_size = match config.consumed_size {
            Some(size) => size,
            None => assembly::read_instance(session, config.consumed_instance)
                .await?
                .len(),
        };
        let produced_size = match config.produced_size {
            Some(size) => size,
            None => assembly::read_instance(session, config.produced_instance)
                .await?
                .len(),
        };

        let connection_serial = self.id_gen.connection_serial();
        let (o_to_t_id, t_to_o_id) = if config.exclusive_owner {
            self.id_gen.point_to_point_pair()
        } else {
            ConnectionIdGen::shared_pair(connection_serial)
        };

        let mut params = ForwardOpenParams {
            o_to_t_id,
            t_to_o_id,
            connection_serial,
            originator_serial: self.id_gen.originator_serial(),
            rpi_us: config.rpi_ms.saturating_mul(1000),
            consumed_size,
            produced_size,
            consumed_instance: config.consumed_instance,
            produced_instance: config.produced_instance,
            exclusive_owner: config.exclusive_owner,
        };

        let (o_to_t_id, t_to_o_id) = forward_open(session, &params).await?;
        // The device's echoed ids are authoritative from here on and must
        // be echoed unchanged on close.
        params.o_to_t_id = o_to_t_id;
        params.t_to_o_id = t_to_o_id;
        Ok(params)
    }

    async fn bring_up(
        &self,
        config: &ImplicitConfig,
    ) -> Result<(ConnectionSlot, mpsc::Receiver<Vec<u8>>)> {
        let hub = self.io_hub().await?;

        let mut session =
            Session::connect(config.target, self.connect_timeout, self.io_timeout).await?;

        let params = match self.negotiate(&mut session, config).await {
            Ok(params) => params,
            Err(e) => {
                session.unregister().await;
                return Err(e);
            }
        };

        // Seed the output image from the device's current consumed data so
        // the first cyclic frame does not blank outputs; zeros on failure.
        let mut output = vec![0u8; params.consumed_size];
        match assembly::read_instance(&mut session, config.consumed_instance).await {
            Ok(seed) => {
                let n = seed.len().min(output.len());
                output[..n].copy_from_slice(&seed[..n]);
            }
            Err(e) => debug!(error = %e, "output seed read failed, starting from zeros"),
        }

        let shared = Arc::new(ConnShared::new(output));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (delivery_tx, delivery_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);

        let route_key = (config.target, params.t_to_o_id);
        lock_routes(&hub.routes).insert(
            route_key,
            Route {
                shared: shared.clone(),
                produced_size: params.produced_size,
                delivery: delivery_tx,
            },
        );

        let io_target = SocketAddrV4::new(config.target, IMPLICIT_PORT);
        let tasks = vec![
            tokio::spawn(sender_task(
                shared.clone(),
                stop_rx.clone(),
                hub.socket.clone(),
                io_target,
                params.o_to_t_id,
                params.consumed_size,
                config.rpi_ms,
            )),
            tokio::spawn(watchdog_task(
                shared.clone(),
                stop_rx,
                watchdog_threshold_ms(config.rpi_ms),
            )),
        ];
        shared.set_state(ConnectionState::Open);
        debug!(target = %config.target, rpi_ms = config.rpi_ms, "implicit connection open");

        let consumed_size = params.consumed_size;
        Ok((
            ConnectionSlot {
                target: config.target,
                shared,
                stop: stop_tx,
                tasks,
                session: Some(session),
                params,
                route_key,
                rpi_ms: config.rpi_ms,
                consumed_size,
            },
            delivery_rx,
        ))
    }

    /// Closes the connection to `target` and releases its slot.
    pub async fn close(&self, target: Ipv4Addr) -> Result<()> {
        let (index, mut slot) = {
            let mut table = self.table.lock().await;
            let index = table
                .slots
                .iter()
                .position(|entry| {
                    matches!(entry, Some(SlotEntry::Active(slot)) if slot.target == target)
                })
                .ok_or(EipError::NotConnected(target))?;
            let slot = match table.slots[index].take() {
                Some(SlotEntry::Active(slot)) => slot,
                _ => unreachable!("position() matched an active slot"),
            };
            // Hold the slot through teardown so a concurrent open to the
            // same target is rejected, not raced.
            table.slots[index] = Some(SlotEntry::Closing(target));
            (index, slot)
        };

        // Send Forward Close while the connection is still fully live;
        // adapters answer fastest on an active connection. A transport
        // error or peer close while awaiting the reply counts as an
        // implicit acknowledgment.
        let was_valid = slot.shared.is_valid();
        slot.shared.set_state(ConnectionState::Closing);
        let mut acked = false;
        if was_valid {
            if let Some(session) = slot.session.as_mut() {
                match forward_close(session, &slot.params).await {
                    Ok(()) => acked = true,
                    Err(EipError::Io(_)) | Err(EipError::PeerClosed { .. }) => acked = true,
                    Err(e) => debug!(error = %e, "forward close not acknowledged"),
                }
            }
        }

        let _ = slot.stop.send(true);
        slot.shared.invalidate();
        for mut task in slot.tasks.drain(..) {
            if timeout(TASK_JOIN_WAIT, &mut task).await.is_err() {
                warn!("connection task did not exit in time, aborting");
                task.abort();
            }
        }
        // Dropping the route also drops the delivery sender, closing the
        // consumer's queue.
        self.remove_route(slot.route_key).await;

        if !acked && was_valid {
            // The adapter may keep transmitting until its own timeout.
            let linger = adapter_timeout(slot.rpi_ms).min(MAX_LINGER);
            debug!(?linger, "waiting out the adapter connection timeout");
            sleep(linger).await;
        }

        if let Some(session) = slot.session.take() {
            session.unregister().await;
        }

        let mut table = self.table.lock().await;
        table.slots[index] = None;
        debug!(target = %target, "implicit connection closed");
        Ok(())
    }

    async fn shared_for(&self, target: Ipv4Addr) -> Result<(Arc<ConnShared>, usize)> {
        let table = self.table.lock().await;
        for entry in table.slots.iter().flatten() {
            if let SlotEntry::Active(slot) = entry {
                if slot.target == target {
                    return Ok((slot.shared.clone(), slot.consumed_size));
                }
            }
        }
        Err(EipError::NotConnected(target))
    }

    /// Replaces the O->T output image; short input is zero-padded to the
    /// connection's consumed size. Delivery happens on the next cycle.
    pub async fn write_output(&self, target: Ipv4Addr, data: &[u8]) -> Result<()> {
        let (shared, consumed_size) = self.shared_for(target).await?;
        if !shared.is_valid() {
            return Err(EipError::NotConnected(target));
        }
        if data.len() > consumed_size {
            return Err(EipError::PayloadTooLarge {
                actual: data.len(),
                limit: consumed_size,
            });
        }
        let mut output = shared.output.lock().await;
        copy_zero_padded(&mut output, data);
        Ok(())
    }

    /// Returns a copy of the current O->T output image.
    pub async fn read_output(&self, target: Ipv4Addr) -> Result<Vec<u8>> {
        let (shared, _) = self.shared_for(target).await?;
        let output = shared.output.lock().await;
        Ok(output.clone())
    }

    /// Current lifecycle state of the connection to `target`, if any.
    pub async fn state(&self, target: Ipv4Addr) -> Option<ConnectionState> {
        let table = self.table.lock().await;
        for entry in table.slots.iter().flatten() {
            match entry {
                SlotEntry::Pending(t) if *t == target => return Some(ConnectionState::Opening),
                SlotEntry::Closing(t) if *t == target => return Some(ConnectionState::Closing),
                SlotEntry::Active(slot) if slot.target == target => {
                    return Some(slot.shared.state())
                }
                _ => {}
            }
        }
        None
    }
}
