//! Hardware seams.
//!
//! The link core never talks to registers; it drives these traits. A board
//! crate implements them over its radio/flash/IMU drivers, the test suite
//! implements them over a simulated air and a RAM flash.

use core::fmt::Debug;

/// Receive metadata stamped by the radio driver.
///
/// `timestamp_us` must come from the same clock as [`Clock::now_us`]; beacon
/// phase alignment is computed from it, so interrupt-latency slop here turns
/// directly into slot jitter.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMeta {
    pub len: usize,
    pub rssi: i8,
    pub timestamp_us: u64,
}

/// 2.4 GHz packet PHY.
///
/// `transmit` is synchronous at these frame sizes (a DATA frame is on the
/// air well under 200 µs); reception is poll-based from the main loop, with
/// the driver free to buffer one frame from its interrupt top-half.
pub trait Radio {
    type Error: Debug;

    /// Tune to `2400 MHz + channel`. Implicitly leaves RX.
    fn set_channel(&mut self, channel: u8) -> Result<(), Self::Error>;

    /// Send one frame; returns once the PHY has accepted it.
    fn transmit(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Open the receive window on the current channel.
    fn start_receive(&mut self) -> Result<(), Self::Error>;

    /// Take a buffered frame, if one arrived since the last poll.
    fn poll_receive(&mut self, buf: &mut [u8]) -> Result<Option<RxMeta>, Self::Error>;
}

/// Monotonic clock; microsecond tick, never wraps in device lifetime.
pub trait Clock {
    fn now_us(&self) -> u64;

    fn now_ms(&self) -> u32 {
        (self.now_us() / 1_000) as u32
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Offset or length not aligned as the operation requires.
    Unaligned,
    /// Access past the end of the managed region.
    OutOfRange,
    /// The part reported a program/erase failure.
    HardwareFault,
}

/// Page-erase flash. Offsets are relative to the region the link owns.
pub trait Flash {
    /// Erase granularity; `erase` offsets and lengths are multiples of this.
    const PAGE_SIZE: usize;

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn erase(&mut self, offset: u32, len: usize) -> Result<(), FlashError>;

    /// Program bytes into erased flash.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
}

/// One gyro + accel sample, calibrated to physical units by the driver.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImuSample {
    /// Angular rate, rad/s, body axes.
    pub gyro: [f32; 3],
    /// Specific force, g, body axes.
    pub accel: [f32; 3],
    /// Magnetic field, arbitrary consistent units, when the part has one.
    pub mag: Option<[f32; 3]>,
    /// Die temperature, °C, when sampled this cycle.
    pub temp_c: Option<f32>,
}

/// Inertial unit, register maps abstracted away by the driver.
pub trait Imu {
    type Error: Debug;

    /// Bring the part up at the given output data rate.
    fn configure(&mut self, odr_hz: u32) -> Result<(), Self::Error>;

    /// True when a new sample is waiting.
    fn data_ready(&mut self) -> Result<bool, Self::Error>;

    fn read_sample(&mut self) -> Result<ImuSample, Self::Error>;

    /// Lowest-power state the part can resume from.
    fn suspend(&mut self) -> Result<(), Self::Error>;

    fn resume(&mut self) -> Result<(), Self::Error>;

    /// Arm motion-triggered wake before deep sleep, if the part supports it.
    fn enable_wake_on_motion(&mut self) -> Result<(), Self::Error>;
}

/// Hardware entropy, used once at first boot to mint the network key.
pub trait Entropy {
    /// A fresh random word, or `None` when the source is dry/absent
    /// (the key generator then falls back to its seeded LFSR).
    fn try_random(&mut self) -> Option<u32>;
}
