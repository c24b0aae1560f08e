//! Stream bridge device wired to a tunnel over a loopback socket
//!
//! The guest side is driven through MMIO register writes against real guest
//! memory; the host side is a TCP peer owned by the test.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::time::Duration;

use guest_bridge::config::BridgeConfig;
use guest_bridge::devices::char_backend::CharBackend;
use guest_bridge::devices::irq::IrqLatch;
use guest_bridge::devices::stream_bridge::{regs, Command, InstanceIds, StreamBridgeDevice};
use guest_bridge::devices::GuestAddressing;
use guest_bridge::pipe::{PipeError, PipeHandle, WakeFlags};
use guest_bridge::reactor::EpollReactor;
use guest_bridge::tunnel::TunnelHub;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

#[path = "common/guest_pipe.rs"]
mod guest_pipe;

use guest_pipe::{run_until, RecordingPipe};

const WAIT: Duration = Duration::from_secs(5);

type SharedHub = Rc<RefCell<TunnelHub<EpollReactor>>>;

/// Device output sink that pushes guest bytes into a tunnel, keeping
/// whatever the socket would not take for a later flush.
struct TunnelBackend {
    hub: SharedHub,
    handle: PipeHandle,
    pending: Rc<RefCell<VecDeque<u8>>>,
}

impl CharBackend for TunnelBackend {
    fn write(&mut self, data: &[u8]) {
        let mut pending = self.pending.borrow_mut();
        pending.extend(data.iter().copied());

        let mut hub = self.hub.borrow_mut();
        while !pending.is_empty() {
            let (front, _) = pending.as_slices();
            match hub.send(self.handle, &[front]) {
                Ok(n) => {
                    pending.drain(..n);
                }
                Err(PipeError::TryAgain) => break,
                Err(e) => panic!("tunnel send failed: {}", e),
            }
        }
    }
}

fn create_test_memory() -> GuestMemoryMmap {
    GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 64 * 1024)]).unwrap()
}

fn write_reg(dev: &mut StreamBridgeDevice, mem: &GuestMemoryMmap, offset: u64, value: u32) {
    dev.mmio_write(offset, &value.to_le_bytes(), mem).unwrap();
}

fn connected_hub() -> (SharedHub, PipeHandle, Rc<RecordingPipe>, std::net::TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    let mut hub = TunnelHub::with_epoll(BridgeConfig::default()).unwrap();
    let (pipe, guest) = RecordingPipe::new();

    let handle = hub.open_named("tcp", guest, Some(&port)).unwrap();
    let (peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(WAIT)).unwrap();

    hub.arm_wake(handle, WakeFlags::WRITE).unwrap();
    assert!(run_until(&mut hub, WAIT, |_| pipe.woken_for(WakeFlags::WRITE)));

    (Rc::new(RefCell::new(hub)), handle, pipe, peer)
}

#[test]
fn test_write_buffer_chunks_reach_peer_in_order() {
    let (hub, handle, pipe, mut peer) = connected_hub();
    let pending = Rc::new(RefCell::new(VecDeque::new()));
    let mem = create_test_memory();

    let payload: Vec<u8> = (0..300u32).map(|i| (i * 7 % 256) as u8).collect();
    mem.write_slice(&payload, GuestAddress(0x2000)).unwrap();

    let backend = TunnelBackend {
        hub: hub.clone(),
        handle,
        pending: pending.clone(),
    };
    let config = BridgeConfig::default();
    let mut ids = InstanceIds::from_config(&config);
    let mut dev = StreamBridgeDevice::new(
        &mut ids,
        Box::new(IrqLatch::new()),
        GuestAddressing::from_config(&config),
    )
    .unwrap()
    .with_backend(Box::new(backend));

    for start in (0..payload.len()).step_by(64) {
        let len = (payload.len() - start).min(64);
        write_reg(&mut dev, &mem, regs::DATA_PTR, 0x2000 + start as u32);
        write_reg(&mut dev, &mem, regs::DATA_LEN, len as u32);
        write_reg(&mut dev, &mem, regs::CMD, Command::WriteBuffer as u32);
    }

    // Flush anything the socket pushed back on.
    while !pending.borrow().is_empty() {
        let wakes = pipe.wake_count();
        let mut h = hub.borrow_mut();
        h.arm_wake(handle, WakeFlags::WRITE).unwrap();
        assert!(run_until(&mut h, WAIT, |_| pipe.wake_count() > wakes));
        let mut queue = pending.borrow_mut();
        let (front, _) = queue.as_slices();
        if let Ok(n) = h.send(handle, &[front]) {
            queue.drain(..n);
        }
    }

    let mut got = vec![0u8; payload.len()];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(got, payload);
}

#[test]
fn test_host_bytes_reach_guest_buffer() {
    let (hub, handle, pipe, mut peer) = connected_hub();
    let mem = create_test_memory();
    let latch = IrqLatch::new();
    let config = BridgeConfig::default();
    let mut ids = InstanceIds::from_config(&config);
    let mut dev = StreamBridgeDevice::new(
        &mut ids,
        Box::new(latch.clone()),
        GuestAddressing::from_config(&config),
    )
    .unwrap();

    write_reg(&mut dev, &mem, regs::CMD, Command::EnableInterrupts as u32);
    peer.write_all(b"from the host").unwrap();

    {
        let mut h = hub.borrow_mut();
        h.arm_wake(handle, WakeFlags::READ).unwrap();
        assert!(run_until(&mut h, WAIT, |_| pipe.woken_for(WakeFlags::READ)));
    }

    let mut buf = vec![0u8; dev.can_receive()];
    let n = hub.borrow_mut().recv(handle, &mut [&mut buf]).unwrap();
    dev.receive(&buf[..n]);
    assert!(latch.is_asserted());

    let mut ready = [0u8; 4];
    dev.mmio_read(regs::BYTES_READY, &mut ready).unwrap();
    let ready = u32::from_le_bytes(ready);
    assert_eq!(ready as usize, n);

    write_reg(&mut dev, &mem, regs::DATA_PTR, 0x800);
    write_reg(&mut dev, &mem, regs::DATA_LEN, ready);
    write_reg(&mut dev, &mem, regs::CMD, Command::ReadBuffer as u32);
    assert!(!latch.is_asserted());

    let mut guest_view = vec![0u8; n];
    mem.read_slice(&mut guest_view, GuestAddress(0x800)).unwrap();
    assert_eq!(&guest_view[..], &b"from the host"[..n]);
}
