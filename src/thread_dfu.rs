//! Thread (802.15.4 mesh) DFU server over CoAP.
//!
//! Serves the init packet at `/i` and the firmware image at `/f`. Two
//! delivery modes:
//!
//! * **Unicast**: devices GET `/i` and `/f` with block-2 transfers and
//!   the server slices from memory, tracking per-client progress.
//! * **Multicast**: a trigger (`POST /t`, or host-initiated) starts a
//!   push thread that PUTs every block of `/i` then `/f` to the
//!   realm-local multicast group with block-1, at a configured rate.
//!   Devices report missed blocks with `PUT /b/<resource>/<spblk>`
//!   bitmaps and the push thread retransmits them until bitmaps stop
//!   arriving.
//!
//! Trigger and bitmap payload integers are big-endian.

use std::collections::{BTreeSet, HashMap};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use coap_lite::{CoapOption, CoapRequest, MessageType, Packet, RequestType, ResponseType};
use log::{debug, info, warn};

use crate::crc::crc32;
use crate::error::{Error, Result};

/// Blocks per superblock in the bitmap recovery scheme.
pub const SUPERBLOCK_BLOCKS: u32 = 64;

/// How long to wait for further bitmaps after the queue drains.
const SPBLK_BMP_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra settle time at flash erase boundaries during the initial
/// multicast pass.
const ERASE_DELAY: Duration = Duration::from_millis(500);

/// Flash page size on the receiving devices; a new page begins every
/// `ERASE_PAGE / block_size` blocks.
const ERASE_PAGE: u32 = 4096;

const DEFAULT_COAP_PORT: u16 = 5683;

/// Trigger flags: upper nibble is the trigger version.
const TRIGGER_VERSION: u8 = 1;
const FLAG_MCAST: u8 = 0x08;
const FLAG_RESET_SUPPRESS: u8 = 0x04;

/// The two served resources, in transmit order: `/i` strictly precedes
/// `/f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Resource {
    Init,
    Image,
}

impl Resource {
    fn path(self) -> &'static str {
        match self {
            Resource::Init => "i",
            Resource::Image => "f",
        }
    }

    fn from_path(path: &str) -> Option<Self> {
        match path {
            "i" => Some(Resource::Init),
            "f" => Some(Resource::Image),
            _ => None,
        }
    }
}

/// The 17-byte DFU trigger carried by `POST /t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPayload {
    pub flags: u8,
    pub init_len: u32,
    pub init_crc: u32,
    pub image_len: u32,
    pub image_crc: u32,
}

impl TriggerPayload {
    pub fn new(init: &[u8], image: &[u8], multicast: bool, suppress_reset: bool) -> Self {
        let mut flags = TRIGGER_VERSION << 4;
        if multicast {
            flags |= FLAG_MCAST;
        }
        if suppress_reset {
            flags |= FLAG_RESET_SUPPRESS;
        }
        Self {
            flags,
            init_len: init.len() as u32,
            init_crc: crc32(init),
            image_len: image.len() as u32,
            image_crc: crc32(image),
        }
    }

    pub fn to_bytes(self) -> [u8; 17] {
        let mut out = [0u8; 17];
        out[0] = self.flags;
        BigEndian::write_u32(&mut out[1..5], self.init_len);
        BigEndian::write_u32(&mut out[5..9], self.init_crc);
        BigEndian::write_u32(&mut out[9..13], self.image_len);
        BigEndian::write_u32(&mut out[13..17], self.image_crc);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 17 {
            return Err(Error::Coap(format!(
                "trigger payload is {} bytes, expected 17",
                bytes.len()
            )));
        }
        Ok(Self {
            flags: bytes[0],
            init_len: BigEndian::read_u32(&bytes[1..5]),
            init_crc: BigEndian::read_u32(&bytes[5..9]),
            image_len: BigEndian::read_u32(&bytes[9..13]),
            image_crc: BigEndian::read_u32(&bytes[13..17]),
        })
    }

    pub fn multicast(self) -> bool {
        self.flags & FLAG_MCAST != 0
    }
}

/// Encode a CoAP block option value: `num << 4 | m << 3 | szx`, as a
/// minimal-length big-endian uint.
fn encode_block_option(num: u32, more: bool, szx: u8) -> Vec<u8> {
    let value = (num << 4) | (u32::from(more) << 3) | u32::from(szx & 0x7);
    if value == 0 {
        return Vec::new();
    }
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

/// Decode a block option value into `(num, more, szx)`.
fn parse_block_option(bytes: &[u8]) -> Result<(u32, bool, u8)> {
    if bytes.len() > 3 {
        return Err(Error::Coap("block option longer than 3 bytes".into()));
    }
    let mut value = 0u32;
    for &b in bytes {
        value = (value << 8) | u32::from(b);
    }
    Ok((value >> 4, value & 0x8 != 0, (value & 0x7) as u8))
}

fn block_size(szx: u8) -> usize {
    16 << szx
}

/// Server configuration. `rate` is blocks per second for the multicast
/// push.
pub struct ThreadDfuConfig {
    pub bind: SocketAddr,
    pub multicast_addr: SocketAddr,
    pub rate: f64,
    /// Block size exponent for the multicast push (2 = 64-byte blocks).
    pub block_szx: u8,
    /// Start the multicast push immediately instead of waiting for a
    /// `POST /t` from the mesh.
    pub multicast: bool,
    /// After a completed multicast upload, tell clients to reset after
    /// this many milliseconds.
    pub reset_delay_ms: Option<u32>,
}

impl Default for ThreadDfuConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0u16; 8], DEFAULT_COAP_PORT)),
            // Realm-local all-nodes group.
            multicast_addr: SocketAddr::from((
                [0xFF03, 0, 0, 0, 0, 0, 0, 0x0001],
                DEFAULT_COAP_PORT,
            )),
            rate: 1.0,
            block_szx: 2,
            multicast: false,
            reset_delay_ms: None,
        }
    }
}

/// Missing-block transmit queue, ordered `(resource, block)`.
type RepairQueue = Arc<Mutex<BTreeSet<(Resource, u32)>>>;

struct ClientProgress {
    resource: Resource,
    blocks_done: u32,
}

pub struct ThreadDfuServer {
    init: Arc<Vec<u8>>,
    image: Arc<Vec<u8>>,
    config: ThreadDfuConfig,
    message_id: u16,
}

impl ThreadDfuServer {
    pub fn new(init: Vec<u8>, image: Vec<u8>, config: ThreadDfuConfig) -> Self {
        Self {
            init: Arc::new(init),
            image: Arc::new(image),
            config,
            message_id: 0,
        }
    }

    /// Serve until the upload completes: multicast push finished and
    /// repair queue drained, or (unicast) a client fetched the final
    /// image block.
    pub fn run(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.bind)?;
        socket.set_read_timeout(Some(Duration::from_millis(250)))?;
        info!(
            "thread DFU server on {}: init {} bytes, image {} bytes",
            self.config.bind,
            self.init.len(),
            self.image.len()
        );

        let queue: RepairQueue = Arc::new(Mutex::new(BTreeSet::new()));
        let done = Arc::new(AtomicBool::new(false));
        let (bmp_tx, bmp_rx) = mpsc::channel();

        // The push thread consumes the bitmap receiver, either right
        // away or when a POST /t trigger arrives.
        let mut pending_rx = Some(bmp_rx);
        let mut push_handle = None;
        if self.config.multicast {
            if let Some(rx) = pending_rx.take() {
                push_handle = Some(self.spawn_push(&socket, Arc::clone(&queue), rx, &done)?);
            }
        }

        let mut progress: HashMap<SocketAddr, ClientProgress> = HashMap::new();
        let mut unicast_complete = false;
        let mut buf = [0u8; 1500];
        loop {
            if done.load(Ordering::Relaxed) || unicast_complete {
                break;
            }
            let (len, source) = match socket.recv_from(&mut buf) {
                Ok(x) => x,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let packet = match Packet::from_bytes(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    debug!("dropping malformed CoAP packet from {source}: {e:?}");
                    continue;
                }
            };
            let mut request = CoapRequest::from_packet(packet, source);
            let path = request.get_path();
            let path = path.trim_start_matches('/').to_string();

            match (*request.get_method(), path.as_str()) {
                (RequestType::Get, "i") | (RequestType::Get, "f") => {
                    let resource = Resource::from_path(&path).unwrap_or(Resource::Init);
                    unicast_complete |=
                        self.serve_block2(&socket, &mut request, resource, &mut progress)?;
                }
                (RequestType::Post, "t") => {
                    let trigger = TriggerPayload::from_bytes(&request.message.payload)?;
                    info!("trigger from {source}: {trigger:?}");
                    self.respond(&socket, &mut request, ResponseType::Changed, Vec::new())?;
                    if trigger.multicast() && push_handle.is_none() {
                        if let Some(rx) = pending_rx.take() {
                            push_handle =
                                Some(self.spawn_push(&socket, Arc::clone(&queue), rx, &done)?);
                        }
                    }
                }
                (RequestType::Put, _) if path.starts_with("b/") => {
                    self.handle_bitmap(&path, &request.message.payload, &queue, &bmp_tx);
                }
                (method, other) => {
                    debug!("ignoring {method:?} /{other} from {source}");
                    self.respond(&socket, &mut request, ResponseType::NotFound, Vec::new())?;
                }
            }
        }

        if let Some(handle) = push_handle {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Answer a block-2 GET. Returns true when this reply carried the
    /// final image block.
    fn serve_block2(
        &mut self,
        socket: &UdpSocket,
        request: &mut CoapRequest<SocketAddr>,
        resource: Resource,
        progress: &mut HashMap<SocketAddr, ClientProgress>,
    ) -> Result<bool> {
        let data = match resource {
            Resource::Init => Arc::clone(&self.init),
            Resource::Image => Arc::clone(&self.image),
        };

        // The client drives block size and number through Block2.
        let (num, szx) = match request.message.get_option(CoapOption::Block2) {
            Some(values) => match values.front() {
                Some(v) => {
                    let (num, _, szx) = parse_block_option(v)?;
                    (num, szx)
                }
                None => (0, self.config.block_szx),
            },
            None => (0, self.config.block_szx),
        };
        let size = block_size(szx);
        let start = num as usize * size;
        if start >= data.len() {
            self.respond(socket, request, ResponseType::BadOption, Vec::new())?;
            return Ok(false);
        }
        let end = (start + size).min(data.len());
        let more = end < data.len();

        let source = *request.source.as_ref().unwrap_or(&self.config.bind);
        let entry = progress.entry(source).or_insert(ClientProgress {
            resource,
            blocks_done: 0,
        });
        if entry.resource != resource {
            entry.resource = resource;
            entry.blocks_done = 0;
        }
        entry.blocks_done = entry.blocks_done.max(num + 1);
        debug!(
            "{source} <- /{} block {num} ({} bytes{})",
            resource.path(),
            end - start,
            if more { "" } else { ", last" }
        );

        if let Some(response) = request.response.as_mut() {
            response.set_status(ResponseType::Content);
            response
                .message
                .add_option(CoapOption::Block2, encode_block_option(num, more, szx));
            response.message.payload = data[start..end].to_vec();
            let bytes = response
                .message
                .to_bytes()
                .map_err(|e| Error::Coap(format!("{e:?}")))?;
            socket.send_to(&bytes, source)?;
        }

        let finished = resource == Resource::Image && !more;
        if finished {
            info!("{source} fetched the final image block");
        }
        Ok(finished)
    }

    /// `PUT /b/<resource>/<spblk>` with `(u16 spblk_num, u64 bitmap)`
    /// big-endian. Set bits mark missing blocks within the superblock,
    /// most significant bit first.
    fn handle_bitmap(
        &self,
        path: &str,
        payload: &[u8],
        queue: &RepairQueue,
        bmp_tx: &Sender<()>,
    ) {
        let mut parts = path.split('/').skip(1);
        let resource = parts.next().and_then(Resource::from_path);
        let (Some(resource), true) = (resource, payload.len() >= 10) else {
            warn!("malformed bitmap report at /{path}");
            return;
        };

        let spblk = u32::from(BigEndian::read_u16(&payload[0..2]));
        let bitmap = BigEndian::read_u64(&payload[2..10]);
        let base = spblk * SUPERBLOCK_BLOCKS;

        let mut queue = match queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut enqueued = 0;
        for bit in 0..SUPERBLOCK_BLOCKS {
            if bitmap & (1u64 << (63 - bit)) != 0 {
                queue.insert((resource, base + bit));
                enqueued += 1;
            }
        }
        drop(queue);
        debug!("/{path}: superblock {spblk}, {enqueued} missing blocks");
        let _ = bmp_tx.send(());
    }

    fn respond(
        &mut self,
        socket: &UdpSocket,
        request: &mut CoapRequest<SocketAddr>,
        status: ResponseType,
        payload: Vec<u8>,
    ) -> Result<()> {
        let source = *request.source.as_ref().unwrap_or(&self.config.bind);
        if let Some(response) = request.response.as_mut() {
            response.set_status(status);
            response.message.payload = payload;
            let bytes = response
                .message
                .to_bytes()
                .map_err(|e| Error::Coap(format!("{e:?}")))?;
            socket.send_to(&bytes, source)?;
        }
        Ok(())
    }

    /// Start the multicast push thread: initial pass over every block
    /// of `/i` then `/f`, then bitmap-driven repair until reports stop.
    fn spawn_push(
        &mut self,
        socket: &UdpSocket,
        queue: RepairQueue,
        bmp_rx: Receiver<()>,
        done: &Arc<AtomicBool>,
    ) -> Result<thread::JoinHandle<()>> {
        let socket = socket.try_clone()?;
        let init = Arc::clone(&self.init);
        let image = Arc::clone(&self.image);
        let done = Arc::clone(done);
        let mcast = self.config.multicast_addr;
        let szx = self.config.block_szx;
        let interval = Duration::from_secs_f64(1.0 / self.config.rate.max(0.001));
        let reset_delay = self.config.reset_delay_ms;
        let mut message_id = self.message_id.wrapping_add(1);
        self.message_id = message_id.wrapping_add(0x1000);

        Ok(thread::spawn(move || {
            let size = block_size(szx);
            let blocks_per_page = (ERASE_PAGE as usize / size).max(1) as u32;

            let push = |message_id: &mut u16, resource: Resource, num: u32| {
                let data = match resource {
                    Resource::Init => &init,
                    Resource::Image => &image,
                };
                let start = num as usize * size;
                if start >= data.len() {
                    return;
                }
                let end = (start + size).min(data.len());
                let more = end < data.len();

                let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
                request.set_method(RequestType::Put);
                request.set_path(resource.path());
                request.message.header.set_type(MessageType::NonConfirmable);
                *message_id = message_id.wrapping_add(1);
                request.message.header.message_id = *message_id;
                request
                    .message
                    .add_option(CoapOption::Block1, encode_block_option(num, more, szx));
                request.message.payload = data[start..end].to_vec();
                match request.message.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, mcast) {
                            warn!("multicast send failed: {e}");
                        }
                    }
                    Err(e) => warn!("CoAP encode failed: {e:?}"),
                }
            };

            // Initial pass: every block of /i, then /f, rate-limited,
            // pausing at erase boundaries so devices can erase the next
            // page.
            for (resource, data) in [(Resource::Init, &init), (Resource::Image, &image)] {
                let nblocks = data.len().div_ceil(size) as u32;
                info!("multicast pass: /{} in {nblocks} blocks", resource.path());
                for num in 0..nblocks {
                    if num > 0 && num % blocks_per_page == 0 {
                        thread::sleep(ERASE_DELAY);
                    }
                    push(&mut message_id, resource, num);
                    thread::sleep(interval);
                }
            }

            // Repair: retransmit reported blocks until no bitmap
            // arrives for SPBLK_BMP_TIMEOUT and the queue is empty.
            loop {
                let popped = {
                    let mut q = match queue.lock() {
                        Ok(q) => q,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    q.iter().next().copied().map(|key| {
                        q.remove(&key);
                        key
                    })
                };
                match popped {
                    Some((resource, num)) => {
                        push(&mut message_id, resource, num);
                        thread::sleep(interval);
                    }
                    None => match bmp_rx.recv_timeout(SPBLK_BMP_TIMEOUT) {
                        Ok(()) => continue,
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                            break;
                        }
                    },
                }
            }

            if let Some(delay) = reset_delay {
                info!("upload complete, requesting reset in {delay} ms");
                let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
                request.set_method(RequestType::Put);
                request.set_path("r");
                request.message.header.set_type(MessageType::NonConfirmable);
                request.message.header.message_id = message_id.wrapping_add(1);
                request.message.payload = delay.to_be_bytes().to_vec();
                if let Ok(bytes) = request.message.to_bytes() {
                    let _ = socket.send_to(&bytes, mcast);
                }
            } else {
                info!("upload complete");
            }
            done.store(true, Ordering::Relaxed);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_payload_layout() {
        let t = TriggerPayload {
            flags: 0x10,
            init_len: 0x0000_0100,
            init_crc: 0xDEAD_BEEF,
            image_len: 0x0000_4000,
            image_crc: 0xCAFE_BABE,
        };
        assert_eq!(
            t.to_bytes(),
            [
                0x10, 0x00, 0x00, 0x01, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x40, 0x00,
                0xCA, 0xFE, 0xBA, 0xBE
            ]
        );
        assert_eq!(TriggerPayload::from_bytes(&t.to_bytes()).unwrap(), t);
    }

    #[test]
    fn trigger_flags() {
        let t = TriggerPayload::new(&[0u8; 16], &[0u8; 64], true, false);
        assert_eq!(t.flags, 0x18);
        assert!(t.multicast());
        assert_eq!(t.init_len, 16);
        assert_eq!(t.init_crc, crc32(&[0u8; 16]));

        let t = TriggerPayload::new(&[], &[], false, true);
        assert_eq!(t.flags, 0x14);
        assert!(!t.multicast());
    }

    #[test]
    fn trigger_rejects_short_payload() {
        assert!(TriggerPayload::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn block_option_roundtrip() {
        assert_eq!(encode_block_option(0, false, 0), Vec::<u8>::new());
        assert_eq!(parse_block_option(&[]).unwrap(), (0, false, 0));

        for (num, more, szx) in [(0, true, 2), (5, false, 2), (300, true, 6), (0xFFFFF, false, 4)]
        {
            let encoded = encode_block_option(num, more, szx);
            assert!(encoded.len() <= 3);
            assert_eq!(parse_block_option(&encoded).unwrap(), (num, more, szx));
        }
    }

    #[test]
    fn block_size_from_szx() {
        assert_eq!(block_size(2), 64);
        assert_eq!(block_size(0), 16);
        assert_eq!(block_size(6), 1024);
    }

    #[test]
    fn repair_queue_orders_init_before_image() {
        let mut queue = BTreeSet::new();
        queue.insert((Resource::Image, 0));
        queue.insert((Resource::Init, 7));
        queue.insert((Resource::Image, 3));
        queue.insert((Resource::Init, 2));
        let order: Vec<_> = queue.into_iter().collect();
        assert_eq!(
            order,
            vec![
                (Resource::Init, 2),
                (Resource::Init, 7),
                (Resource::Image, 0),
                (Resource::Image, 3)
            ]
        );
    }

    #[test]
    fn bitmap_bits_are_msb_first() {
        let server = ThreadDfuServer::new(vec![0; 16], vec![0; 4096], ThreadDfuConfig::default());
        let queue: RepairQueue = Arc::new(Mutex::new(BTreeSet::new()));
        let (tx, rx) = mpsc::channel();

        // Superblock 1, blocks 0 and 63 missing.
        let mut payload = [0u8; 10];
        BigEndian::write_u16(&mut payload[0..2], 1);
        BigEndian::write_u64(&mut payload[2..10], 0x8000_0000_0000_0001);
        server.handle_bitmap("b/f/1", &payload, &queue, &tx);

        let q = queue.lock().unwrap();
        assert!(q.contains(&(Resource::Image, 64)));
        assert!(q.contains(&(Resource::Image, 127)));
        assert_eq!(q.len(), 2);
        assert!(rx.try_recv().is_ok());
    }
}
