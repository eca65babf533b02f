use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::channel;
use crate::network::remote::RemoteLink;
use crate::network::{unexpected, Communicator, Link, Message, Rank, TransferError, COORDINATOR};

/// Capacity of the in-memory channels between two ranks.
const CHANNEL_CAPACITY: usize = 16;

/// Maximum number of attempts to make for connecting to the coordinator.
const CONNECT_ATTEMPTS: usize = 32;
/// Timeout for connecting to the coordinator.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// To avoid spamming the connections, wait this timeout before trying again. If the connection
/// fails again this timeout will be doubled up to `RETRY_MAX_TIMEOUT`.
const RETRY_INITIAL_TIMEOUT: Duration = Duration::from_millis(8);
/// Maximum timeout between connection attempts.
const RETRY_MAX_TIMEOUT: Duration = Duration::from_secs(1);
/// Interval between two polls of the listener while waiting for the workers.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Build the communicators of `size` ranks living in the same process, in rank order.
pub fn local_world(size: usize, timeout: Duration) -> Vec<Communicator> {
    assert!(size > 0, "a world needs at least one rank");
    let mut coordinator_links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
    let mut world = Vec::with_capacity(size);
    for rank in 1..size {
        let (to_worker, from_coordinator) = channel::bounded(CHANNEL_CAPACITY);
        let (to_coordinator, from_worker) = channel::bounded(CHANNEL_CAPACITY);
        coordinator_links[rank] = Some(Link::Local {
            tx: to_worker,
            rx: from_worker,
        });
        let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
        links[COORDINATOR] = Some(Link::Local {
            tx: to_coordinator,
            rx: from_coordinator,
        });
        world.push(Communicator::new(rank, size, timeout, links));
    }
    world.insert(
        0,
        Communicator::new(COORDINATOR, size, timeout, coordinator_links),
    );
    world
}

/// Resolve an address, failing if it resolves to nothing.
fn resolve(address: &str, peer: Rank) -> Result<Vec<SocketAddr>, TransferError> {
    let io_error = |source| TransferError::Io {
        peer,
        address: address.to_string(),
        source,
    };
    let addrs: Vec<_> = address.to_socket_addrs().map_err(io_error)?.collect();
    if addrs.is_empty() {
        return Err(io_error(std::io::Error::new(
            ErrorKind::AddrNotAvailable,
            "the address does not resolve to anything",
        )));
    }
    Ok(addrs)
}

/// Bind the listening socket of the coordinator.
pub fn bind_coordinator(address: &str) -> Result<TcpListener, TransferError> {
    let addrs = resolve(address, COORDINATOR)?;
    log::debug!("coordinator binding {:?}", addrs);
    TcpListener::bind(&*addrs).map_err(|source| TransferError::Io {
        peer: COORDINATOR,
        address: address.to_string(),
        source,
    })
}

/// Wait for the `size - 1` workers to connect to the coordinator.
///
/// Every worker introduces itself with a `Hello` message carrying its rank. A rank that is out of
/// range or that connects twice is a protocol violation. If not all the workers connect within
/// `timeout` the run fails.
pub fn accept_workers(
    listener: TcpListener,
    size: usize,
    timeout: Duration,
) -> Result<Communicator, TransferError> {
    let address = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let io_error = |source| TransferError::Io {
        peer: COORDINATOR,
        address: address.clone(),
        source,
    };
    listener.set_nonblocking(true).map_err(io_error)?;
    log::debug!(
        "coordinator ready at {}, waiting for {} workers",
        address,
        size - 1
    );

    let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
    let deadline = Instant::now() + timeout;
    let mut connected = 0;
    while connected < size - 1 {
        let (stream, peer_addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    let missing = (1..size).find(|&r| links[r].is_none()).unwrap_or(size);
                    return Err(TransferError::Timeout {
                        peer: missing,
                        timeout,
                    });
                }
                sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                log::warn!("coordinator failed to accept incoming connection: {:?}", e);
                continue;
            }
        };
        stream.set_nonblocking(false).map_err(io_error)?;
        let mut link = RemoteLink::new(stream, timeout).map_err(io_error)?;

        // the rank is not known yet: the hello message is read from whoever connected
        let rank = match link.recv_any(COORDINATOR)? {
            (sender, Message::Hello { rank }) if sender == rank => rank,
            (sender, Message::Hello { rank }) => {
                return Err(TransferError::RankMismatch {
                    expected: sender,
                    found: rank,
                })
            }
            (sender, other) => return Err(unexpected(sender, "hello", &other)),
        };
        if rank == COORDINATOR || rank >= size || links[rank].is_some() {
            log::error!("rank {} at {} is not valid or already connected", rank, peer_addr);
            return Err(TransferError::RankMismatch {
                expected: connected + 1,
                found: rank,
            });
        }
        connected += 1;
        log::debug!(
            "rank {} connected from {} ({} / {})",
            rank,
            peer_addr,
            connected,
            size - 1
        );
        links[rank] = Some(Link::Remote(link));
    }
    log::info!("all {} workers connected", size - 1);
    Ok(Communicator::new(COORDINATOR, size, timeout, links))
}

/// Connect a worker to the coordinator and introduce it.
///
/// - At first the address is resolved to an actual address (DNS resolution)
/// - Then at most `CONNECT_ATTEMPTS` are performed, and an exponential backoff is used in case
///   of errors.
pub fn connect_coordinator(
    address: &str,
    rank: Rank,
    size: usize,
    timeout: Duration,
) -> Result<Communicator, TransferError> {
    let stream = connect_remote(address, rank)?;
    let link = Link::remote(stream, timeout).map_err(|source| TransferError::Io {
        peer: COORDINATOR,
        address: address.to_string(),
        source,
    })?;
    let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
    links[COORDINATOR] = Some(link);
    let mut comm = Communicator::new(rank, size, timeout, links);
    comm.send(COORDINATOR, Message::Hello { rank })?;
    Ok(comm)
}

fn connect_remote(address: &str, rank: Rank) -> Result<TcpStream, TransferError> {
    let socket_addrs = resolve(address, COORDINATOR)?;
    let mut retry_delay = RETRY_INITIAL_TIMEOUT;
    let mut last_error = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        log::debug!(
            "rank {} connecting to {:?} ({} attempt)",
            rank,
            socket_addrs,
            attempt,
        );

        for address in socket_addrs.iter() {
            match TcpStream::connect_timeout(address, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    return Ok(stream);
                }
                Err(err) => {
                    match err.kind() {
                        ErrorKind::TimedOut => {
                            log::debug!("rank {rank} timeout connecting to {address:?}");
                        }
                        ErrorKind::ConnectionRefused => {
                            log::log!(
                                if attempt > 4 {
                                    log::Level::Warn
                                } else {
                                    log::Level::Debug
                                },
                                "rank {rank} connection refused connecting to {address:?} ({attempt})"
                            );
                        }
                        _ => {
                            log::warn!("rank {rank} failed to connect to {address:?}: {err:?}");
                        }
                    }
                    last_error = Some(err);
                }
            }
        }

        sleep(retry_delay);
        retry_delay = (2 * retry_delay).min(RETRY_MAX_TIMEOUT);
    }
    Err(TransferError::Io {
        peer: COORDINATOR,
        address: address.to_string(),
        source: last_error.unwrap_or_else(|| ErrorKind::NotConnected.into()),
    })
}
