//! Plain TCP server and client over loopback.

use devmem_bench::config::{ClientConfig, EngineConfig, ServerConfig};
use devmem_bench::memory::{HostMemory, MemoryProvider, pattern};
use devmem_bench::transport::{self, RxMode, TxMode};
use devmem_bench::{Error, KI_B, socket};
use std::net::{Ipv4Addr, SocketAddr};
use std::thread;

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

fn client_config(peer: SocketAddr, iterations: usize) -> ClientConfig {
    ClientConfig {
        bind: None,
        peer,
        iterations,
        chunk_size: None,
        interface: None,
        engine: EngineConfig::default(),
    }
}

#[test]
fn test_tcp_transfer_validates() {
    const SIZE: usize = 64 * KI_B;
    let listener = socket::listen(loopback()).unwrap();
    let config = ServerConfig {
        bind: listener.local_addr().unwrap(),
        iterations: 3,
        validate: true,
        engine: EngineConfig::default(),
    };
    let peer = config.bind;

    let server = thread::spawn(move || {
        let memory = HostMemory::new();
        let mut dest = memory.allocate(SIZE).unwrap();
        transport::serve(&memory, &mut dest, RxMode::Tcp, &listener, &config)
    });

    let memory = HostMemory::new();
    let mut source = memory.allocate(SIZE).unwrap();
    pattern::fill_region(&memory, &mut source).unwrap();
    let sent =
        transport::run_client(&memory, &source, TxMode::Tcp, &client_config(peer, 3)).unwrap();

    let received = server.join().unwrap().unwrap();
    assert_eq!(sent.bytes_transferred, 3 * SIZE as u64);
    assert_eq!(received.bytes_transferred, 3 * SIZE as u64);
    assert_eq!(received.sessions, 3);
    assert!(received.gbps() > 0.0);
}

#[test]
fn test_tcp_transfer_detects_corruption() {
    const SIZE: usize = 4 * KI_B;
    let listener = socket::listen(loopback()).unwrap();
    let config = ServerConfig {
        bind: listener.local_addr().unwrap(),
        iterations: 1,
        validate: true,
        engine: EngineConfig::default(),
    };
    let peer = config.bind;

    let server = thread::spawn(move || {
        let memory = HostMemory::new();
        let mut dest = memory.allocate(SIZE).unwrap();
        transport::serve(&memory, &mut dest, RxMode::Tcp, &listener, &config)
    });

    // Zeroed source: every byte not on a multiple of ten is wrong.
    let memory = HostMemory::new();
    let source = memory.allocate(SIZE).unwrap();
    transport::run_client(&memory, &source, TxMode::Tcp, &client_config(peer, 1)).unwrap();

    match server.join().unwrap() {
        Err(Error::Validation { first, mismatches }) => {
            assert_eq!(first, 1);
            assert_eq!(mismatches, SIZE - SIZE.div_ceil(10));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn test_client_without_server_fails_to_connect() {
    let listener = socket::listen(loopback()).unwrap();
    let peer = listener.local_addr().unwrap();
    drop(listener);

    let memory = HostMemory::new();
    let source = memory.allocate(16).unwrap();
    let err =
        transport::run_client(&memory, &source, TxMode::Tcp, &client_config(peer, 1)).unwrap_err();
    assert!(matches!(err, Error::Socket { op: "connect", .. }));
}
