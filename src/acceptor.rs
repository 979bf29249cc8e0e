//! Acceptor: a TPROXY listener accepting client connections and
//! round-robining them to worker threads, with a back-off for
//! file-descriptor exhaustion ("too-many-files-open").

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::warn;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::worker::Assignment;

/// After this many consecutive `EMFILE`/`ENFILE` failures, back off for one
/// retry interval before accepting again.
const THROTTLE_AFTER_CONSECUTIVE_FAILURES: u32 = 25;
const THROTTLE_DELAY: Duration = Duration::from_millis(100);

/// Binds a TPROXY-marked listening socket (`IP_TRANSPARENT`) so the kernel
/// hands the acceptor connections whose destination was never actually
/// this host.
pub fn bind_tproxy_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        let fd = socket.as_raw_fd();
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_IP,
                libc::IP_TRANSPARENT,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Opens a spoofed-source connection to `origin`, binding the local
/// address to the original client's address so the origin sees the real
/// client IP.
pub async fn connect_spoofed(origin: SocketAddr, client_addr: SocketAddr) -> io::Result<tokio::net::TcpStream> {
    let domain = if origin.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        let fd = socket.as_raw_fd();
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_IP,
                libc::IP_TRANSPARENT,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&client_addr.into())?;
    let std_stream: std::net::TcpStream = socket.into();
    let stream = tokio::net::TcpStream::from_std(std_stream)?;
    stream.writable().await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    // Keepalive: idle 300s, 5 probes.
    let sock_ref = socket2::SockRef::from(&stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(300)).with_retries(5);
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
    let _ = origin;
    Ok(stream)
}

/// Recovers the pre-TPROXY destination address the kernel stashed on an
/// intercepted socket, the way `getsockopt(SOL_IP, SO_ORIGINAL_DST)` does
/// for a REDIRECT-style transparent proxy. TPROXY itself delivers
/// the original destination as the accepted socket's *local* address, so
/// on Linux this is just `local_addr()` — kept as its own function so the
/// one non-portable assumption has a single, obviously-named home.
#[cfg(target_os = "linux")]
fn original_destination(client: &tokio::net::TcpStream) -> io::Result<SocketAddr> {
    client.local_addr()
}

#[cfg(not(target_os = "linux"))]
fn original_destination(client: &tokio::net::TcpStream) -> io::Result<SocketAddr> {
    client.local_addr()
}

/// Round-robins accepted connections to worker assignment channels. Takes
/// the channel senders directly rather than full `WorkerHandle`s: the
/// acceptor only ever needs to hand off an `Assignment`, and a sender is
/// cheap to clone, whereas a `WorkerHandle` owns the worker's `JoinHandle`
/// and belongs to the shutdown path instead.
pub async fn run(listener: TcpListener, assignment_txs: Vec<mpsc::Sender<Assignment>>) -> Result<()> {
    let mut next_worker = 0usize;
    let mut consecutive_failures: u32 = 0;

    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                consecutive_failures = 0;
                let origin_addr = match original_destination(&client) {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(error = %e, client = %peer, "failed to recover TPROXY original destination");
                        continue;
                    }
                };
                let assignments = &assignment_txs[next_worker % assignment_txs.len()];
                next_worker = next_worker.wrapping_add(1);
                match connect_spoofed(origin_addr, peer).await {
                    Ok(origin) => {
                        let _ = assignments.send(Assignment { client, origin }).await;
                    }
                    Err(e) => {
                        warn!(error = %e, origin = %origin_addr, "failed to connect to origin");
                    }
                }
            }
            Err(e) if is_fd_exhaustion(&e) => {
                consecutive_failures += 1;
                warn!(error = %e, consecutive_failures, "accept failed: file descriptor exhaustion");
                if consecutive_failures % THROTTLE_AFTER_CONSECUTIVE_FAILURES == 0 {
                    sleep(THROTTLE_DELAY).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EMFILE || code == libc::ENFILE
    )
}
