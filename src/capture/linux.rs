// Linux capture — AF_PACKET raw socket bound to one interface.
//
// Port selection happens in userspace (the ingest checks the configured
// port list), so the socket takes everything the interface sees. A receive
// timeout keeps the read loop responsive to shutdown.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::SystemTime;

use crate::error::WatchError;
use crate::packet::LinkType;

const ETH_P_ALL: u16 = 0x0003;
const SOL_PACKET: i32 = 263;
const PACKET_ADD_MEMBERSHIP: i32 = 1;
const PACKET_MR_PROMISC: u16 = 1;

/// Largest frame the read buffer accommodates: standard MTU plus headers is
/// far below this, jumbo frames fit as well.
const READ_BUFFER_SIZE: usize = 65_536;

#[repr(C)]
#[allow(non_camel_case_types)]
struct packet_mreq {
    mr_ifindex: i32,
    mr_type: u16,
    mr_alen: u16,
    mr_address: [u8; 8],
}

/// One captured frame handed to the worker threads.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub ts: SystemTime,
    pub data: Vec<u8>,
}

/// AF_PACKET capture device.
pub struct PacketCapture {
    fd: OwnedFd,
    buffer: Vec<u8>,
    interface: String,
}

impl PacketCapture {
    /// Open a raw socket bound to `interface` in promiscuous mode.
    pub fn new(interface: &str) -> Result<Self, WatchError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (ETH_P_ALL as u32).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(WatchError::CaptureDevice(format!(
                "socket(AF_PACKET) failed: {}",
                io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let if_index = if_nametoindex(interface)?;

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = if_index as i32;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(WatchError::CaptureDevice(format!(
                "bind({interface}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        // Promiscuous membership: responses addressed to other hosts still
        // matter to a passive observer.
        let mreq = packet_mreq {
            mr_ifindex: if_index as i32,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_PACKET,
                PACKET_ADD_MEMBERSHIP,
                &mreq as *const packet_mreq as *const libc::c_void,
                std::mem::size_of::<packet_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!(
                "promiscuous mode unavailable on {interface}: {}",
                io::Error::last_os_error()
            );
        }

        // Receive timeout so the capture loop can poll the shutdown flag.
        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: 100_000,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(WatchError::CaptureDevice(format!(
                "setsockopt(SO_RCVTIMEO) failed: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Self {
            fd,
            buffer: vec![0u8; READ_BUFFER_SIZE],
            interface: interface.to_string(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    /// Read one frame. `Ok(None)` means the receive timeout elapsed with
    /// nothing to deliver.
    pub fn read_frame(&mut self) -> Result<Option<CapturedFrame>, WatchError> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(None)
                }
                _ => Err(WatchError::CaptureDevice(format!(
                    "recv on {} failed: {err}",
                    self.interface
                ))),
            };
        }
        Ok(Some(CapturedFrame {
            ts: SystemTime::now(),
            data: self.buffer[..n as usize].to_vec(),
        }))
    }
}

fn if_nametoindex(interface: &str) -> Result<u32, WatchError> {
    let name = std::ffi::CString::new(interface)
        .map_err(|_| WatchError::CaptureDevice(format!("invalid interface name {interface:?}")))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(WatchError::CaptureDevice(format!(
            "unknown interface {interface}: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(index)
}
