// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hostname resolution helpers. Default service principals are built
//! from the canonical form of the server hostname, and spawned commands
//! get the reverse-resolved client hostname when one exists, so we need
//! the canonicalizing variants of getaddrinfo and getnameinfo that the
//! standard library does not expose.

use std::{
    ffi::{CStr, CString},
    net::{IpAddr, SocketAddr},
    ptr,
};

use anyhow::{anyhow, Context as _};

/// Resolve a hostname to its canonical form via a forward lookup with
/// AI_CANONNAME, lowercased for use in a service principal.
pub fn canonical_hostname(host: &str) -> anyhow::Result<String> {
    let c_host = CString::new(host).context("hostname contains a nul byte")?;
    let hints = libc::addrinfo {
        ai_flags: libc::AI_CANONNAME,
        ai_family: libc::AF_UNSPEC,
        ai_socktype: libc::SOCK_STREAM,
        ai_protocol: 0,
        ai_addrlen: 0,
        ai_addr: ptr::null_mut(),
        ai_canonname: ptr::null_mut(),
        ai_next: ptr::null_mut(),
    };
    let mut res: *mut libc::addrinfo = ptr::null_mut();

    // Safety: c_host and hints outlive the call, res is freed with
    // freeaddrinfo on every path where getaddrinfo succeeded.
    unsafe {
        let rc = libc::getaddrinfo(c_host.as_ptr(), ptr::null(), &hints, &mut res);
        if rc != 0 {
            let detail = CStr::from_ptr(libc::gai_strerror(rc)).to_string_lossy().into_owned();
            return Err(anyhow!("cannot resolve {}: {}", host, detail));
        }

        let canonname = (*res).ai_canonname;
        let name = if canonname.is_null() {
            String::from(host)
        } else {
            CStr::from_ptr(canonname).to_string_lossy().into_owned()
        };
        libc::freeaddrinfo(res);
        Ok(name.to_lowercase())
    }
}

/// Best-effort reverse lookup of a client address. Returns None when
/// the address has no name; commands then simply run without
/// REMOTE_HOST in their environment.
pub fn reverse_lookup(addr: &IpAddr) -> Option<String> {
    let sockaddr = SocketAddr::new(*addr, 0);
    let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];

    let (storage, len) = sockaddr_storage(&sockaddr);

    // Safety: the storage buffer is a correctly initialized sockaddr of
    // the advertised length and the host buffer is sized to NI_MAXHOST.
    let rc = unsafe {
        libc::getnameinfo(
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }

    // Safety: getnameinfo nul-terminates the host buffer on success.
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

fn sockaddr_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: zeroed is a valid bit pattern for sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            // Safety: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn localhost_resolves() {
        // localhost exists everywhere we run tests; the canonical name
        // varies, so just check the call succeeds and lowercases.
        let name = canonical_hostname("localhost").expect("localhost to resolve");
        assert!(!name.is_empty());
        assert_eq!(name, name.to_lowercase());
    }

    #[test]
    fn garbage_hostname_errors() {
        assert!(canonical_hostname("no-such-host.invalid.").is_err());
    }
}
