//! Collective communication between data-parallel workers.
//!
//! Every worker must issue the same collectives in the same order; a worker
//! that skips one stalls the others. All blocking calls here are bounded by
//! a timeout, so such a mismatch surfaces as an error instead of a hang.
//!
//! Two backends: NCCL for CUDA devices (feature `nccl`) and a portable TCP
//! star topology for everything else.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[cfg(feature = "nccl")]
use cudarc::driver::safe::{CudaContext, CudaStream};
#[cfg(feature = "nccl")]
use cudarc::nccl::safe::{Comm, Id};
#[cfg(feature = "nccl")]
use std::sync::Arc;

const HANDSHAKE_MAGIC: u32 = 0x4744_5031;

/// Distributed configuration for data-parallel training
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Total number of worker processes
    pub world_size: usize,
    /// This process's rank (0 to world_size-1)
    pub rank: usize,
    /// Rendezvous address, where rank 0 listens
    pub master_addr: String,
    /// Rendezvous port
    pub master_port: u16,
    /// Upper bound on worker discovery
    pub rendezvous_timeout: Duration,
    /// Upper bound on any single collective
    pub collective_timeout: Duration,
    /// Path to communication file for NCCL ID exchange
    pub comm_file: String,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            rendezvous_timeout: Duration::from_secs(30),
            collective_timeout: Duration::from_secs(1800),
            comm_file: "nccl_id.txt".to_string(),
        }
    }
}

impl DistributedConfig {
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    fn master_socket_addr(&self) -> Result<SocketAddr> {
        (self.master_addr.as_str(), self.master_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Rendezvous {
                rank: self.rank,
                reason: format!(
                    "cannot resolve {}:{}",
                    self.master_addr, self.master_port
                ),
            })
    }
}

/// A process group all workers belong to.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum across all workers, in place. Every worker ends up
    /// with bit-identical values.
    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()>;

    /// Blocks until every worker has reached the barrier.
    fn barrier(&self) -> Result<()>;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

/// Averages a scalar across all workers, in place.
///
/// Sum-then-divide rather than a native average, which not every backend
/// offers.
pub fn avg_between_processes(comm: &dyn Communicator, value: &mut f32) -> Result<()> {
    avg_slice_between_processes(comm, std::slice::from_mut(value))
}

pub fn avg_slice_between_processes(comm: &dyn Communicator, data: &mut [f32]) -> Result<()> {
    if comm.world_size() == 1 {
        return Ok(());
    }
    comm.all_reduce_sum(data)?;
    let world_size = comm.world_size() as f32;
    data.iter_mut().for_each(|v| *v /= world_size);
    Ok(())
}

/// Averages a set of tensors across workers with a single collective.
pub fn sync_gradients(comm: &dyn Communicator, tensors: &[Tensor]) -> Result<Vec<Tensor>> {
    if comm.world_size() == 1 {
        return Ok(tensors.to_vec());
    }
    let mut flat = Vec::with_capacity(tensors.iter().map(|t| t.elem_count()).sum());
    for t in tensors {
        flat.extend(
            t.flatten_all()?
                .to_dtype(candle_core::DType::F32)?
                .to_vec1::<f32>()?,
        );
    }
    avg_slice_between_processes(comm, &mut flat)?;

    let mut offset = 0;
    let mut out = Vec::with_capacity(tensors.len());
    for t in tensors {
        let n = t.elem_count();
        let synced = Tensor::from_slice(&flat[offset..offset + n], t.shape(), t.device())?
            .to_dtype(t.dtype())?;
        out.push(synced);
        offset += n;
    }
    Ok(out)
}

/// Replaces `tensors` on every worker with rank 0's values.
///
/// Built on the sum reduction: non-main ranks contribute zeros, which keeps
/// rank 0's values exact.
pub fn broadcast_from_main(comm: &dyn Communicator, tensors: &[Tensor]) -> Result<Vec<Tensor>> {
    if comm.world_size() == 1 {
        return Ok(tensors.to_vec());
    }
    let mut flat = Vec::with_capacity(tensors.iter().map(|t| t.elem_count()).sum());
    for t in tensors {
        if comm.is_main_process() {
            flat.extend(
                t.flatten_all()?
                    .to_dtype(candle_core::DType::F32)?
                    .to_vec1::<f32>()?,
            );
        } else {
            flat.resize(flat.len() + t.elem_count(), 0.0);
        }
    }
    comm.all_reduce_sum(&mut flat)?;

    let mut offset = 0;
    let mut out = Vec::with_capacity(tensors.len());
    for t in tensors {
        let n = t.elem_count();
        out.push(
            Tensor::from_slice(&flat[offset..offset + n], t.shape(), t.device())?
                .to_dtype(t.dtype())?,
        );
        offset += n;
    }
    Ok(out)
}

/// Names the NCCL id file after the run: `nccl_id.txt` becomes
/// `nccl_id.<run_id>.txt`. A file left behind by another run is never read.
pub fn run_comm_file(comm_file: &str, run_id: &str) -> String {
    let path = Path::new(comm_file);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("nccl_id");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.{run_id}.{ext}"),
        None => format!("{stem}.{run_id}"),
    };
    path.with_file_name(name).display().to_string()
}

/// Writes `id` to `path` through a temporary file, so readers never see a
/// partial id.
#[cfg_attr(not(feature = "nccl"), allow(dead_code))]
fn publish_id_file(path: &Path, id: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, id)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Waits until `path` holds an id of `len` bytes. Fails with
/// [`Error::Rendezvous`] at `deadline`.
#[cfg_attr(not(feature = "nccl"), allow(dead_code))]
fn wait_for_id_file(path: &Path, len: usize, rank: usize, deadline: Instant) -> Result<Vec<u8>> {
    loop {
        if path.exists() {
            let data = std::fs::read(path)?;
            if data.len() != len {
                return Err(Error::Rendezvous {
                    rank,
                    reason: format!(
                        "id file {} holds {} bytes, expected {len}",
                        path.display(),
                        data.len()
                    ),
                });
            }
            return Ok(data);
        }
        if Instant::now() >= deadline {
            return Err(Error::Rendezvous {
                rank,
                reason: format!("id file {} never appeared", path.display()),
            });
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Collective backend, chosen from the device a worker trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Single worker, nothing to synchronize
    Local,
    /// NCCL over CUDA devices
    Nccl,
    /// Portable TCP fallback
    Tcp,
}

impl Backend {
    pub fn select(device: &Device, world_size: usize) -> Self {
        if world_size <= 1 {
            Backend::Local
        } else if device.is_cuda() && cfg!(feature = "nccl") {
            Backend::Nccl
        } else {
            Backend::Tcp
        }
    }
}

/// Joins the process group described by `config`. Fails if the group does
/// not assemble within the rendezvous timeout.
pub fn connect(config: &DistributedConfig, device: &Device) -> Result<Box<dyn Communicator>> {
    if config.rank >= config.world_size {
        return Err(Error::Config(format!(
            "rank {} out of range for world size {}",
            config.rank, config.world_size
        )));
    }
    let backend = Backend::select(device, config.world_size);
    info!(
        "Rank {}/{}: initializing {:?} communicator",
        config.rank, config.world_size, backend
    );
    match backend {
        Backend::Local => Ok(Box::new(LocalCommunicator)),
        Backend::Tcp => Ok(Box::new(TcpCommunicator::connect(config)?)),
        #[cfg(feature = "nccl")]
        Backend::Nccl => Ok(Box::new(NcclCommunicator::new(config)?)),
        #[cfg(not(feature = "nccl"))]
        Backend::Nccl => Err(Error::Backend(
            "NCCL support not enabled. Build with --features nccl".to_string(),
        )),
    }
}

/// World of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _data: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Star-topology TCP process group.
///
/// Rank 0 accepts one connection per peer. A reduction gathers every
/// contribution at rank 0, sums them in rank order and sends the total
/// back, so the result never depends on arrival order.
pub struct TcpCommunicator {
    rank: usize,
    world_size: usize,
    /// Rank 0: streams to ranks 1..world_size, in order. Others: one stream to rank 0.
    links: Mutex<Vec<TcpStream>>,
    sequence: Mutex<u32>,
}

impl TcpCommunicator {
    pub fn connect(config: &DistributedConfig) -> Result<Self> {
        let addr = config.master_socket_addr()?;
        let deadline = Instant::now() + config.rendezvous_timeout;
        let links = if config.rank == 0 {
            Self::accept_peers(config, addr, deadline)?
        } else {
            vec![Self::dial_master(config, addr, deadline)?]
        };
        for link in &links {
            link.set_nodelay(true)?;
            link.set_read_timeout(Some(config.collective_timeout))?;
            link.set_write_timeout(Some(config.collective_timeout))?;
        }
        info!(
            "Rank {}/{}: TCP communicator initialized",
            config.rank, config.world_size
        );
        Ok(Self {
            rank: config.rank,
            world_size: config.world_size,
            links: Mutex::new(links),
            sequence: Mutex::new(0),
        })
    }

    fn rendezvous_error(rank: usize, reason: impl Into<String>) -> Error {
        Error::Rendezvous {
            rank,
            reason: reason.into(),
        }
    }

    fn accept_peers(
        config: &DistributedConfig,
        addr: SocketAddr,
        deadline: Instant,
    ) -> Result<Vec<TcpStream>> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("Rank 0: listening for {} peers on {}", config.world_size - 1, addr);

        let mut slots: Vec<Option<TcpStream>> = (1..config.world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < slots.len() {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1))))?;
                    let magic = stream.read_u32::<LittleEndian>()?;
                    let rank = stream.read_u32::<LittleEndian>()? as usize;
                    let world_size = stream.read_u32::<LittleEndian>()? as usize;
                    if magic != HANDSHAKE_MAGIC {
                        debug!("Rank 0: ignoring stray connection from {}", peer);
                        continue;
                    }
                    if world_size != config.world_size || rank == 0 || rank >= config.world_size {
                        return Err(Self::rendezvous_error(
                            0,
                            format!("peer {peer} announced rank {rank} of world {world_size}"),
                        ));
                    }
                    let slot = &mut slots[rank - 1];
                    if slot.is_some() {
                        return Err(Self::rendezvous_error(
                            0,
                            format!("rank {rank} joined twice"),
                        ));
                    }
                    debug!("Rank 0: rank {} joined from {}", rank, peer);
                    *slot = Some(stream);
                    joined += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Self::rendezvous_error(
                            0,
                            format!(
                                "timed out after {:?} with {}/{} peers joined",
                                config.rendezvous_timeout,
                                joined,
                                config.world_size - 1
                            ),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Release everyone only once the whole group is present.
        let mut links: Vec<TcpStream> = slots.into_iter().flatten().collect();
        for link in &mut links {
            link.write_u32::<LittleEndian>(HANDSHAKE_MAGIC)?;
        }
        Ok(links)
    }

    fn dial_master(
        config: &DistributedConfig,
        addr: SocketAddr,
        deadline: Instant,
    ) -> Result<TcpStream> {
        info!("Rank {}: connecting to rank 0 at {}", config.rank, addr);
        let mut stream = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Self::rendezvous_error(
                    config.rank,
                    format!("rank 0 unreachable at {addr} after {:?}", config.rendezvous_timeout),
                ));
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(Duration::from_millis(100)),
            }
        };
        stream.write_u32::<LittleEndian>(HANDSHAKE_MAGIC)?;
        stream.write_u32::<LittleEndian>(config.rank as u32)?;
        stream.write_u32::<LittleEndian>(config.world_size as u32)?;

        // Wait for the go signal sent once every rank has joined.
        stream.set_read_timeout(Some(
            deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1)),
        ))?;
        match stream.read_u32::<LittleEndian>() {
            Ok(HANDSHAKE_MAGIC) => Ok(stream),
            Ok(other) => Err(Self::rendezvous_error(
                config.rank,
                format!("unexpected handshake reply {other:#x}"),
            )),
            Err(e) => Err(Self::rendezvous_error(
                config.rank,
                format!("group did not assemble: {e}"),
            )),
        }
    }

    fn map_io(&self, op: &'static str, e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::CollectiveTimeout {
                rank: self.rank,
                op,
            },
            _ => Error::Collective {
                rank: self.rank,
                op,
                reason: e.to_string(),
            },
        }
    }

    fn encode(sequence: u32, data: &[f32]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 4 * data.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        let start = buf.len();
        buf.resize(start + 4 * data.len(), 0);
        LittleEndian::write_f32_into(data, &mut buf[start..]);
        buf
    }

    fn read_frame(stream: &mut TcpStream, out: &mut [f32]) -> io::Result<(u32, usize)> {
        let sequence = stream.read_u32::<LittleEndian>()?;
        let len = stream.read_u32::<LittleEndian>()? as usize;
        if len != out.len() {
            return Ok((sequence, len));
        }
        let mut bytes = vec![0u8; 4 * len];
        stream.read_exact(&mut bytes)?;
        LittleEndian::read_f32_into(&bytes, out);
        Ok((sequence, len))
    }

    fn reduce(&self, op: &'static str, data: &mut [f32]) -> Result<()> {
        let mut sequence = self.sequence.lock();
        *sequence = sequence.wrapping_add(1);
        let mut links = self.links.lock();

        if self.rank == 0 {
            let mut incoming = vec![0f32; data.len()];
            for (i, link) in links.iter_mut().enumerate() {
                let (peer_sequence, len) = Self::read_frame(link, &mut incoming)
                    .map_err(|e| self.map_io(op, e))?;
                if peer_sequence != *sequence || len != data.len() {
                    return Err(Error::Collective {
                        rank: 0,
                        op,
                        reason: format!(
                            "rank {} sent collective #{} of {} values, expected #{} of {}",
                            i + 1,
                            peer_sequence,
                            len,
                            *sequence,
                            data.len()
                        ),
                    });
                }
                data.iter_mut().zip(&incoming).for_each(|(d, v)| *d += v);
            }
            let frame = Self::encode(*sequence, data);
            for link in links.iter_mut() {
                link.write_all(&frame).map_err(|e| self.map_io(op, e))?;
            }
        } else {
            let link = &mut links[0];
            link.write_all(&Self::encode(*sequence, data))
                .map_err(|e| self.map_io(op, e))?;
            let (root_sequence, len) =
                Self::read_frame(link, data).map_err(|e| self.map_io(op, e))?;
            if root_sequence != *sequence || len != data.len() {
                return Err(Error::Collective {
                    rank: self.rank,
                    op,
                    reason: format!(
                        "rank 0 answered collective #{} of {} values, expected #{} of {}",
                        root_sequence,
                        len,
                        *sequence,
                        data.len()
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()> {
        self.reduce("all_reduce", data)
    }

    fn barrier(&self) -> Result<()> {
        self.reduce("barrier", &mut [0.0])
    }
}

/// NCCL Communicator wrapper for gradient synchronization
#[cfg(feature = "nccl")]
pub struct NcclCommunicator {
    comm: Comm,
    stream: Arc<CudaStream>,
    rank: usize,
    world_size: usize,
}

#[cfg(feature = "nccl")]
impl NcclCommunicator {
    /// Initialize NCCL communicator
    ///
    /// Rank 0 creates the NCCL ID and writes it to a file.
    /// Other ranks wait for the file, up to the rendezvous timeout.
    /// Rank 0 removes the file once the whole group has formed.
    pub fn new(config: &DistributedConfig) -> Result<Self> {
        const ID_LEN: usize = 128;
        let comm_file = Path::new(&config.comm_file);
        let deadline = Instant::now() + config.rendezvous_timeout;
        let backend_err = |what: &str, e: &dyn std::fmt::Debug| {
            Error::Backend(format!("{what}: {e:?}"))
        };

        let id = if config.rank == 0 {
            if comm_file.exists() {
                std::fs::remove_file(comm_file)?;
            }
            let id = Id::new().map_err(|e| backend_err("Failed to create NCCL ID", &e))?;
            let bytes: Vec<u8> = id.internal().iter().map(|&i| i as u8).collect();
            publish_id_file(comm_file, &bytes)?;
            info!("Rank 0: Created NCCL ID and wrote to {:?}", comm_file);
            id
        } else {
            info!("Rank {}: Waiting for NCCL ID file...", config.rank);
            let data = wait_for_id_file(comm_file, ID_LEN, config.rank, deadline)?;
            let mut internal = [0i8; ID_LEN];
            internal
                .iter_mut()
                .zip(data)
                .for_each(|(dst, b)| *dst = b as i8);
            info!("Rank {}: Read NCCL ID from {:?}", config.rank, comm_file);
            Id::uninit(internal)
        };

        let ctx = CudaContext::new(config.rank)
            .map_err(|e| backend_err("Failed to create CUDA context", &e))?;
        let stream = ctx.default_stream();
        let comm = Comm::from_rank(stream.clone(), config.rank, config.world_size, id)
            .map_err(|e| backend_err("Failed to create NCCL communicator", &e.0))?;

        let communicator = Self {
            comm,
            stream,
            rank: config.rank,
            world_size: config.world_size,
        };
        // Every peer has read the id once the group exists.
        communicator.barrier()?;
        if config.rank == 0 {
            std::fs::remove_file(comm_file)?;
        }
        info!("Rank {}: NCCL communicator initialized", config.rank);
        Ok(communicator)
    }
}

#[cfg(feature = "nccl")]
impl Communicator for NcclCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()> {
        use cudarc::nccl::safe::ReduceOp;

        let collective_err = |reason: String| Error::Collective {
            rank: self.rank,
            op: "all_reduce",
            reason,
        };
        let gpu_data = self
            .stream
            .clone_htod(&data.to_vec())
            .map_err(|e| collective_err(format!("copy to GPU: {e:?}")))?;
        let mut gpu_output = self
            .stream
            .alloc_zeros::<f32>(data.len())
            .map_err(|e| collective_err(format!("allocate GPU buffer: {e:?}")))?;
        self.comm
            .all_reduce(&gpu_data, &mut gpu_output, &ReduceOp::Sum)
            .map_err(|e| collective_err(format!("{:?}", e.0)))?;
        let output = self
            .stream
            .clone_dtoh(&gpu_output)
            .map_err(|e| collective_err(format!("copy from GPU: {e:?}")))?;
        data.copy_from_slice(&output);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.all_reduce_sum(&mut [0.0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn group_config(world_size: usize, rank: usize, port: u16) -> DistributedConfig {
        DistributedConfig {
            world_size,
            rank,
            master_port: port,
            rendezvous_timeout: Duration::from_secs(10),
            collective_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Runs `f` on `world_size` TCP-connected ranks, one thread each.
    fn run_group<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(&TcpCommunicator) -> T + Send + Sync + Clone + 'static,
    {
        let port = free_port();
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let f = f.clone();
                thread::spawn(move || {
                    let comm = TcpCommunicator::connect(&group_config(world_size, rank, port))
                        .unwrap();
                    f(&comm)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_avg_between_processes_four_workers() {
        let results = run_group(4, |comm| {
            let mut value = (comm.rank() + 1) as f32;
            avg_between_processes(comm, &mut value).unwrap();
            value
        });
        assert_eq!(results, vec![2.5; 4]);
    }

    #[test]
    fn test_all_reduce_is_identical_on_every_rank() {
        let results = run_group(3, |comm| {
            let base = 0.1f32 * (comm.rank() as f32 + 1.0);
            let mut data = vec![base, base * 3.0, -base, 1e-7];
            // Stagger arrival order.
            thread::sleep(Duration::from_millis(30 * (3 - comm.rank()) as u64));
            comm.all_reduce_sum(&mut data).unwrap();
            data
        });
        assert!(results.iter().all(|r| r == &results[0]));
        assert!((results[0][0] - 0.6).abs() < 1e-6);
        assert!((results[0][2] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_repeated_collectives_and_barrier() {
        let results = run_group(2, |comm| {
            let mut totals = Vec::new();
            for step in 0..5 {
                let mut v = [step as f32 + comm.rank() as f32];
                comm.all_reduce_sum(&mut v).unwrap();
                totals.push(v[0]);
            }
            comm.barrier().unwrap();
            totals
        });
        assert_eq!(results[0], vec![1.0, 3.0, 5.0, 7.0, 9.0]);
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_mismatched_collective_is_reported() {
        let results = run_group(2, |comm| {
            let mut data = vec![1.0f32; comm.rank() + 1];
            comm.all_reduce_sum(&mut data).is_err()
        });
        assert!(results[0]);
    }

    #[test]
    fn test_rendezvous_times_out_without_peers() {
        let config = DistributedConfig {
            rendezvous_timeout: Duration::from_millis(200),
            ..group_config(2, 0, free_port())
        };
        let start = Instant::now();
        let err = TcpCommunicator::connect(&config).err().unwrap();
        assert!(matches!(err, Error::Rendezvous { rank: 0, .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_collective_times_out_when_peer_skips_it() {
        let port = free_port();
        let peer = thread::spawn(move || {
            let comm = TcpCommunicator::connect(&group_config(2, 1, port)).unwrap();
            // Never joins the collective; keep the link open past the timeout.
            thread::sleep(Duration::from_millis(800));
            drop(comm);
        });
        let config = DistributedConfig {
            collective_timeout: Duration::from_millis(200),
            ..group_config(2, 0, port)
        };
        let comm = TcpCommunicator::connect(&config).unwrap();
        let err = comm.all_reduce_sum(&mut [1.0]).unwrap_err();
        assert!(matches!(err, Error::CollectiveTimeout { rank: 0, .. }));
        peer.join().unwrap();
    }

    #[test]
    fn test_local_communicator_is_identity() {
        let comm = LocalCommunicator;
        let mut value = 3.0;
        avg_between_processes(&comm, &mut value).unwrap();
        assert_eq!(value, 3.0);
        comm.barrier().unwrap();
    }

    #[test]
    fn test_sync_gradients_averages_across_ranks() {
        let results = run_group(2, |comm| {
            let device = Device::Cpu;
            let r = comm.rank() as f32;
            let a = Tensor::new(&[[r, 2.0 * r], [1.0, 1.0]], &device).unwrap();
            let b = Tensor::new(&[10.0 * r], &device).unwrap();
            let synced = sync_gradients(comm, &[a, b]).unwrap();
            (
                synced[0].to_vec2::<f32>().unwrap(),
                synced[1].to_vec1::<f32>().unwrap(),
            )
        });
        for (a, b) in results {
            assert_eq!(a, vec![vec![0.5, 1.0], vec![1.0, 1.0]]);
            assert_eq!(b, vec![5.0]);
        }
    }

    #[test]
    fn test_broadcast_from_main() {
        let results = run_group(3, |comm| {
            let value = comm.rank() as f32 + 1.0;
            let t = Tensor::new(&[value, -value], &Device::Cpu).unwrap();
            broadcast_from_main(comm, &[t]).unwrap()[0]
                .to_vec1::<f32>()
                .unwrap()
        });
        assert!(results.iter().all(|r| r == &vec![1.0, -1.0]));
    }

    #[test]
    fn test_run_comm_file_is_per_run() {
        assert_eq!(run_comm_file("nccl_id.txt", "42"), "nccl_id.42.txt");
        assert_eq!(run_comm_file("ids/nccl", "7"), "ids/nccl.7");
        assert_ne!(
            run_comm_file("nccl_id.txt", "1"),
            run_comm_file("nccl_id.txt", "2")
        );
    }

    #[test]
    fn test_id_file_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(run_comm_file("nccl_id.txt", "run"));
        let id: Vec<u8> = (0..128u8).collect();

        let reader = {
            let path = path.clone();
            thread::spawn(move || {
                wait_for_id_file(&path, 128, 1, Instant::now() + Duration::from_secs(10))
            })
        };
        thread::sleep(Duration::from_millis(150));
        publish_id_file(&path, &id).unwrap();

        assert_eq!(reader.join().unwrap().unwrap(), id);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_id_file_wait_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nccl_id.missing.txt");
        let start = Instant::now();
        let err = wait_for_id_file(&missing, 128, 1, Instant::now() + Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, Error::Rendezvous { rank: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(5));

        std::fs::write(&missing, [0u8; 16]).unwrap();
        assert!(matches!(
            wait_for_id_file(&missing, 128, 1, Instant::now()),
            Err(Error::Rendezvous { .. })
        ));
    }

    #[test]
    fn test_backend_selection() {
        assert_eq!(Backend::select(&Device::Cpu, 1), Backend::Local);
        assert_eq!(Backend::select(&Device::Cpu, 4), Backend::Tcp);
    }
}
