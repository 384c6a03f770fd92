//! Sample clock divisors.
//!
//! Continuous acquisition is paced by two cascaded 8254 counters fed from a
//! 10 MHz root clock. The scan rate is `ROOT_CLOCK_HZ / (divisor_a * divisor_b)`,
//! with each divisor between 2 and 0xFFFF.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{AiousbError, Result};
use crate::transport::{Transport, AUR_CTR_MODELOAD, USB_WRITE_TO_DEVICE};

/// Counter input clock.
pub const ROOT_CLOCK_HZ: u64 = 10_000_000;

const MIN_DIVISOR: u64 = 2;
const MAX_DIVISOR: u64 = 0xFFFF;

/// Divisors for counters 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDivisors {
    /// Counter 1 (mode 2, rate generator)
    pub divisor_a: u16,
    /// Counter 2 (mode 3, square wave)
    pub divisor_b: u16,
}

impl ClockDivisors {
    /// Pick the divisor pair whose product best matches `ROOT_CLOCK_HZ / hz`.
    pub fn for_frequency(hz: u32) -> Result<Self> {
        if hz == 0 {
            return Err(AiousbError::invalid_parameter(
                "clock frequency must be non-zero",
            ));
        }
        let hz = u64::from(hz);
        if hz * 4 >= ROOT_CLOCK_HZ {
            return Ok(Self::from_pair(MIN_DIVISOR, MIN_DIVISOR));
        }

        let target = ROOT_CLOCK_HZ / hz;
        let root = (target as f64).sqrt().round() as u64;
        if root > MAX_DIVISOR {
            return Ok(Self::from_pair(MAX_DIVISOR, MAX_DIVISOR));
        }

        let mut best = (MAX_DIVISOR, MAX_DIVISOR, u64::MAX);
        for b in (MIN_DIVISOR..=root.max(MIN_DIVISOR)).rev() {
            let a = ((target as f64) / (b as f64)).round() as u64;
            if a > MAX_DIVISOR {
                break;
            }
            let a = a.max(MIN_DIVISOR);
            let err = target.abs_diff(a * b);
            if err < best.2 {
                best = (a, b, err);
            }
            if err == 0 {
                break;
            }
        }

        let divisors = Self::from_pair(best.0, best.1);
        debug!(
            hz,
            divisor_a = divisors.divisor_a,
            divisor_b = divisors.divisor_b,
            error = best.2,
            "Calculated clock divisors"
        );
        Ok(divisors)
    }

    fn from_pair(a: u64, b: u64) -> Self {
        Self {
            divisor_a: a.clamp(MIN_DIVISOR, MAX_DIVISOR) as u16,
            divisor_b: b.clamp(MIN_DIVISOR, MAX_DIVISOR) as u16,
        }
    }

    /// Scan rate these divisors produce.
    pub fn actual_hz(&self) -> f64 {
        ROOT_CLOCK_HZ as f64 / (f64::from(self.divisor_a) * f64::from(self.divisor_b))
    }

    /// Program counters 1 and 2 of counter block 0.
    pub fn load(&self, transport: &dyn Transport, timeout: Duration) -> Result<()> {
        load_counter(transport, 0, 1, 2, self.divisor_a, timeout)?;
        load_counter(transport, 0, 2, 3, self.divisor_b, timeout)?;
        info!(
            divisor_a = self.divisor_a,
            divisor_b = self.divisor_b,
            hz = self.actual_hz(),
            "Loaded sample clock"
        );
        Ok(())
    }
}

/// Set the mode of one 8254 counter and load its count in a single request.
pub fn load_counter(
    transport: &dyn Transport,
    block: u8,
    counter: u8,
    mode: u8,
    count: u16,
    timeout: Duration,
) -> Result<()> {
    if counter > 2 || mode > 5 {
        return Err(AiousbError::invalid_parameter(format!(
            "counter {counter} mode {mode} is not a valid 8254 setting"
        )));
    }
    let value = (u16::from(counter) << 14) | (0x3 << 12) | (u16::from(mode) << 9) | u16::from(block);
    transport.control_transfer(
        USB_WRITE_TO_DEVICE,
        AUR_CTR_MODELOAD,
        value,
        count,
        &mut [],
        timeout,
    )?;
    Ok(())
}
