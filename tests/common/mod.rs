//! Mock HAL: a shared "air" joining simulated radios, a RAM flash with page
//! semantics and fault injection, a hand-cranked clock, and a scripted IMU.
#![allow(dead_code)]

use core::convert::Infallible;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use moclink::hal::{Clock, Entropy, Flash, FlashError, Imu, ImuSample, Radio, RxMeta};

#[derive(Clone, Default)]
pub struct MockClock(Rc<Cell<u64>>);

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_us(&self, us: u64) {
        self.0.set(self.0.get() + us);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1_000);
    }

    pub fn set_us(&self, us: u64) {
        self.0.set(us);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.0.get()
    }
}

struct Station {
    channel: u8,
    listening: bool,
    promiscuous: bool,
    rx: VecDeque<(Vec<u8>, u64, i8)>,
}

impl Station {
    fn new(promiscuous: bool) -> Self {
        Self {
            channel: 0,
            listening: promiscuous,
            promiscuous,
            rx: VecDeque::new(),
        }
    }
}

/// Every radio sees every transmission on its tuned channel, instantly.
#[derive(Clone)]
pub struct Air {
    stations: Rc<RefCell<Vec<Rc<RefCell<Station>>>>>,
    clock: MockClock,
    /// Drop everything in flight while set; simulates a deep fade.
    pub jam: Rc<Cell<bool>>,
}

impl Air {
    pub fn new(clock: MockClock) -> Self {
        Self {
            stations: Rc::new(RefCell::new(Vec::new())),
            clock,
            jam: Rc::new(Cell::new(false)),
        }
    }

    pub fn radio(&self) -> MockRadio {
        self.attach(false)
    }

    /// Hears every channel; used to observe or inject raw bytes.
    pub fn probe(&self) -> MockRadio {
        self.attach(true)
    }

    fn attach(&self, promiscuous: bool) -> MockRadio {
        let station = Rc::new(RefCell::new(Station::new(promiscuous)));
        self.stations.borrow_mut().push(station.clone());
        MockRadio { station, air: self.clone() }
    }

    fn deliver(&self, from: &Rc<RefCell<Station>>, channel: u8, data: &[u8]) {
        if self.jam.get() {
            return;
        }
        let now = self.clock.now_us();
        for station in self.stations.borrow().iter() {
            if Rc::ptr_eq(station, from) {
                continue;
            }
            let mut st = station.borrow_mut();
            if st.listening && (st.promiscuous || st.channel == channel) {
                st.rx.push_back((data.to_vec(), now, -40));
            }
        }
    }
}

pub struct MockRadio {
    station: Rc<RefCell<Station>>,
    air: Air,
}

impl MockRadio {
    /// Raw injection on an arbitrary channel, bypassing the tuned one.
    pub fn inject_on(&mut self, channel: u8, data: &[u8]) {
        self.air.deliver(&self.station, channel, data);
    }

    /// Most recent captured frame, promiscuous probes only.
    pub fn captured(&mut self) -> Option<Vec<u8>> {
        self.station.borrow_mut().rx.pop_front().map(|(d, _, _)| d)
    }

    pub fn clear_captured(&mut self) {
        self.station.borrow_mut().rx.clear();
    }
}

impl Radio for MockRadio {
    type Error = Infallible;

    fn set_channel(&mut self, channel: u8) -> Result<(), Self::Error> {
        let mut st = self.station.borrow_mut();
        st.channel = channel;
        if !st.promiscuous {
            st.listening = false;
        }
        Ok(())
    }

    fn transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let channel = self.station.borrow().channel;
        self.air.deliver(&self.station, channel, data);
        Ok(())
    }

    fn start_receive(&mut self) -> Result<(), Self::Error> {
        self.station.borrow_mut().listening = true;
        Ok(())
    }

    fn poll_receive(&mut self, buf: &mut [u8]) -> Result<Option<RxMeta>, Self::Error> {
        let mut st = self.station.borrow_mut();
        let Some((data, timestamp_us, rssi)) = st.rx.pop_front() else {
            return Ok(None);
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some(RxMeta { len, rssi, timestamp_us }))
    }
}

/// RAM flash, 256-byte pages, erased to 0xFF; shared between "boots" by
/// cloning. `fail_writes` makes every program operation fault.
#[derive(Clone)]
pub struct MockFlash {
    mem: Rc<RefCell<Vec<u8>>>,
    pub fail_writes: Rc<Cell<bool>>,
}

impl MockFlash {
    pub fn new(size: usize) -> Self {
        Self {
            mem: Rc::new(RefCell::new(vec![0xFF; size])),
            fail_writes: Rc::new(Cell::new(false)),
        }
    }

    pub fn corrupt_byte(&self, offset: usize) {
        self.mem.borrow_mut()[offset] ^= 0x01;
    }
}

impl Flash for MockFlash {
    const PAGE_SIZE: usize = 256;

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let mem = self.mem.borrow();
        let end = offset as usize + buf.len();
        if end > mem.len() {
            return Err(FlashError::OutOfRange);
        }
        buf.copy_from_slice(&mem[offset as usize..end]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: usize) -> Result<(), FlashError> {
        if offset as usize % Self::PAGE_SIZE != 0 || len % Self::PAGE_SIZE != 0 {
            return Err(FlashError::Unaligned);
        }
        let mut mem = self.mem.borrow_mut();
        let end = offset as usize + len;
        if end > mem.len() {
            return Err(FlashError::OutOfRange);
        }
        mem[offset as usize..end].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.fail_writes.get() {
            return Err(FlashError::HardwareFault);
        }
        let mut mem = self.mem.borrow_mut();
        let end = offset as usize + data.len();
        if end > mem.len() {
            return Err(FlashError::OutOfRange);
        }
        mem[offset as usize..end].copy_from_slice(data);
        Ok(())
    }
}

/// Scripted IMU: feed samples in, the tracker drains them one per tick.
#[derive(Clone, Default)]
pub struct MockImu {
    samples: Rc<RefCell<VecDeque<ImuSample>>>,
}

impl MockImu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: ImuSample) {
        self.samples.borrow_mut().push_back(sample);
    }

    pub fn pending(&self) -> usize {
        self.samples.borrow().len()
    }
}

impl Imu for MockImu {
    type Error = Infallible;

    fn configure(&mut self, _odr_hz: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn data_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.samples.borrow().is_empty())
    }

    fn read_sample(&mut self) -> Result<ImuSample, Self::Error> {
        Ok(self.samples.borrow_mut().pop_front().unwrap_or_default())
    }

    fn suspend(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn resume(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn enable_wake_on_motion(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Entropy source that is always dry; forces the LFSR fallback.
pub struct NoEntropy;

impl Entropy for NoEntropy {
    fn try_random(&mut self) -> Option<u32> {
        None
    }
}

/// Entropy source that hands out one fixed word forever.
pub struct FixedEntropy(pub u32);

impl Entropy for FixedEntropy {
    fn try_random(&mut self) -> Option<u32> {
        Some(self.0)
    }
}
