//! TCP MD5 signature option (RFC 2385).
//!
//! The key must be installed on the socket before the handshake starts:
//! the kernel signs the SYN and drops unsigned segments from the peer.

use std::net::SocketAddr;

use socket2::Socket;

use crate::error::{NetworkError, NetworkResult};

/// Longest key the kernel accepts.
pub const MAX_KEY_LEN: usize = 80;

/// Install (or, with an empty key, remove) the signature key for `peer`.
pub fn set_signature_key(socket: &Socket, peer: SocketAddr, key: &[u8]) -> NetworkResult<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(NetworkError::Signature {
            addr: peer,
            reason: format!(
                "key is {} bytes long, at most {} are supported",
                key.len(),
                MAX_KEY_LEN
            ),
        });
    }

    platform::set(socket, peer, key)
}

#[cfg(target_os = "linux")]
mod platform {
    use std::io;
    use std::mem;
    use std::net::SocketAddr;
    use std::os::fd::AsRawFd;
    use std::ptr;

    use socket2::{SockAddr, Socket};

    use super::MAX_KEY_LEN;
    use crate::error::{NetworkError, NetworkResult};

    /// `TCP_MD5SIG` from `linux/tcp.h`.
    const TCP_MD5SIG: libc::c_int = 14;

    /// `struct tcp_md5sig` from `linux/tcp.h`.
    #[repr(C)]
    struct TcpMd5Sig {
        addr: libc::sockaddr_storage,
        flags: u8,
        prefixlen: u8,
        keylen: u16,
        ifindex: libc::c_int,
        key: [u8; MAX_KEY_LEN],
    }

    pub(super) fn set(socket: &Socket, peer: SocketAddr, key: &[u8]) -> NetworkResult<()> {
        let sockaddr = SockAddr::from(peer);

        // SAFETY: all-zero is a valid value for every field of the struct.
        let mut sig: TcpMd5Sig = unsafe { mem::zeroed() };
        // SAFETY: `sockaddr` is at most `sockaddr_storage` bytes long.
        unsafe {
            ptr::copy_nonoverlapping(
                sockaddr.as_ptr() as *const u8,
                &mut sig.addr as *mut libc::sockaddr_storage as *mut u8,
                sockaddr.len() as usize,
            );
        }
        sig.keylen = key.len() as u16;
        sig.key[..key.len()].copy_from_slice(key);

        // SAFETY: `sig` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                TCP_MD5SIG,
                &sig as *const TcpMd5Sig as *const libc::c_void,
                mem::size_of::<TcpMd5Sig>() as libc::socklen_t,
            )
        };

        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        let reason = match err.raw_os_error() {
            Some(libc::ENOPROTOOPT) => {
                "this kernel does not support TCP MD5 signatures".to_string()
            }
            Some(libc::ENOENT) if key.is_empty() => "no key installed for this peer".to_string(),
            _ => err.to_string(),
        };
        Err(NetworkError::Signature { addr: peer, reason })
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::net::SocketAddr;

    use socket2::Socket;

    use crate::error::{NetworkError, NetworkResult};

    pub(super) fn set(_socket: &Socket, _peer: SocketAddr, _key: &[u8]) -> NetworkResult<()> {
        Err(NetworkError::Unsupported("TCP MD5 signature"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    #[test]
    fn test_rejects_oversized_key() {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let peer: SocketAddr = "192.0.2.1:179".parse().unwrap();

        let err = set_signature_key(&socket, peer, &[b'k'; MAX_KEY_LEN + 1]).unwrap_err();

        match err {
            NetworkError::Signature { addr, reason } => {
                assert_eq!(addr, peer);
                assert!(reason.contains("81 bytes"));
            }
            other => panic!("Expected Signature error, got {:?}", other),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_key_accepted_or_reported() {
        // Kernels built without CONFIG_TCP_MD5SIG reject the option; both
        // outcomes must surface as a typed result, never a panic.
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let peer: SocketAddr = "192.0.2.1:179".parse().unwrap();

        match set_signature_key(&socket, peer, b"secret") {
            Ok(()) => {}
            Err(NetworkError::Signature { addr, .. }) => assert_eq!(addr, peer),
            Err(other) => panic!("Unexpected error: {:?}", other),
        }
    }
}
