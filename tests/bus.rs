#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    convert::Infallible,
    rc::Rc,
};

use an400_telemetry::{
    CanController, Clock, ErrorFlags, ExtendedId, RawFrame, RxBuffer, RxFlags, StandardId, Uplink,
};
use embedded_can::Frame;

#[derive(Debug, Default)]
struct Controller {
    pending: VecDeque<RawFrame>,
    buffers: [Option<RawFrame>; 2],
    overflow: ErrorFlags,
    overflows_cleared: usize,
}

impl Controller {
    fn fill(&mut self) {
        while let Some(frame) = self.pending.pop_front() {
            match self.buffers.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(frame),
                None => self.overflow.rx1_overflow = true,
            }
        }
    }
}

/// Two receive buffers fed from frames queued on the bus.
///
/// Queued frames move into a free buffer whenever the loop polls, buffer 0
/// first, like the controller's rollover mode. A frame that finds both
/// buffers full is lost and latches an overflow. Clones share the same
/// controller so a test can keep feeding frames after handing one to the node.
#[derive(Debug, Clone, Default)]
pub struct FakeCan(Rc<RefCell<Controller>>);

impl FakeCan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a frame on the bus.
    pub fn arrive(&self, frame: RawFrame) {
        self.0.borrow_mut().pending.push_back(frame);
    }

    /// Loads queued frames into the buffers without the node polling.
    pub fn deliver(&self) {
        self.0.borrow_mut().fill();
    }

    pub fn overflow(&self) -> ErrorFlags {
        self.0.borrow().overflow
    }

    pub fn overflows_cleared(&self) -> usize {
        self.0.borrow().overflows_cleared
    }

    fn slot(buffer: RxBuffer) -> usize {
        match buffer {
            RxBuffer::Rx0 => 0,
            RxBuffer::Rx1 => 1,
        }
    }
}

impl CanController for FakeCan {
    type Error = Infallible;

    fn poll_receive_flags(&mut self) -> Result<RxFlags, Infallible> {
        let mut controller = self.0.borrow_mut();
        controller.fill();

        Ok(RxFlags {
            rx0: controller.buffers[0].is_some(),
            rx1: controller.buffers[1].is_some(),
        })
    }

    fn read_frame(&mut self, buffer: RxBuffer) -> Result<RawFrame, Infallible> {
        let frame = self.0.borrow().buffers[Self::slot(buffer)].expect("read from an empty buffer");
        Ok(frame)
    }

    fn clear_receive_flag(&mut self, buffer: RxBuffer) -> Result<(), Infallible> {
        self.0.borrow_mut().buffers[Self::slot(buffer)] = None;
        Ok(())
    }

    fn error_flags(&mut self) -> Result<ErrorFlags, Infallible> {
        Ok(self.0.borrow().overflow)
    }

    fn clear_overflow(&mut self, flags: ErrorFlags) -> Result<(), Infallible> {
        let mut controller = self.0.borrow_mut();
        if flags.rx0_overflow {
            controller.overflow.rx0_overflow = false;
        }
        if flags.rx1_overflow {
            controller.overflow.rx1_overflow = false;
        }
        controller.overflows_cleared += 1;
        Ok(())
    }
}

/// Shared millisecond counter the test advances by hand.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<u32>>);

impl ManualClock {
    pub fn set(&self, now_ms: u32) {
        self.0.set(now_ms);
    }

    pub fn advance(&self, ms: u32) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&mut self) -> u32 {
        self.0.get()
    }
}

/// Keeps every transmitted line or datagram.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Rc<RefCell<Vec<Vec<u8>>>>);

impl Recorder {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.borrow().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|bytes| String::from_utf8(bytes).expect("uplink carried non UTF-8"))
            .collect()
    }
}

impl Uplink for Recorder {
    type Error = Infallible;

    fn transmit(&mut self, bytes: &[u8]) -> Result<(), Infallible> {
        self.0.borrow_mut().push(bytes.to_vec());
        Ok(())
    }
}

pub fn extended(id: u32, data: &[u8]) -> RawFrame {
    RawFrame::new(ExtendedId::new(id).unwrap(), data).unwrap()
}

pub fn standard(id: u16, data: &[u8]) -> RawFrame {
    RawFrame::new(StandardId::new(id).unwrap(), data).unwrap()
}

pub fn close(a: f32, b: f32, tolerance: f32) -> bool {
    (a - b).abs() <= tolerance
}

/* AN400 sample traffic */

/// rpm 5000, tps 0.0, fot 2.2 ms, ign 12.0 deg
pub fn pe1() -> RawFrame {
    extended(0x0CFF_F048, &[0x88, 0x13, 0x00, 0x00, 0x16, 0x00, 0x78, 0x00])
}

/// baro 100.00, map 98.30, lambda 0.98, kPa
pub fn pe2_kpa() -> RawFrame {
    extended(0x0CFF_F148, &[0x10, 0x27, 0x66, 0x26, 0x62, 0x00, 0x01, 0x00])
}

/// ai2 raw 2584, oil 52.1 psi with the default calibration
pub fn pe3() -> RawFrame {
    extended(0x0CFF_F248, &[0x00, 0x00, 0x18, 0x0A, 0x00, 0x00, 0x00, 0x00])
}

/// battery 12.70 V, air 25.0 C, coolant 84.2 C
pub fn pe6_celsius() -> RawFrame {
    extended(0x0CFF_F548, &[0xF6, 0x04, 0xFA, 0x00, 0x4A, 0x03, 0x01, 0x00])
}
