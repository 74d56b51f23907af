//! Metering of graph traffic. Every record moved between the heap and storage (or between a
//! caller's heap and a callee's) is reported here with its byte size before it is committed.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use crate::params::*;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("out of energy")]
pub struct ResourceExhausted;

pub trait StorageFeeProcessor: Send {
    fn read_static_data_from_storage(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted>;
    fn write_static_data_to_storage(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted>;
    fn read_one_instance_from_storage(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted>;
    fn write_one_instance_to_storage(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted>;
    fn read_static_data_from_heap(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted>;
    fn write_static_data_to_heap(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted>;
    fn read_one_instance_from_heap(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted>;
    fn write_one_instance_to_heap(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted>;
}

pub type SharedFees = Arc<Mutex<dyn StorageFeeProcessor>>;

/// Charges nothing.
pub struct NullFees;

impl NullFees {
    pub fn shared() -> SharedFees {
        Arc::new(Mutex::new(NullFees))
    }
}

impl StorageFeeProcessor for NullFees {
    fn read_static_data_from_storage(&mut self, _: usize) -> Result<(), ResourceExhausted> {
        Ok(())
    }
    fn write_static_data_to_storage(&mut self, _: usize) -> Result<(), ResourceExhausted> {
        Ok(())
    }
    fn read_one_instance_from_storage(&mut self, _: usize) -> Result<(), ResourceExhausted> {
        Ok(())
    }
    fn write_one_instance_to_storage(&mut self, _: usize) -> Result<(), ResourceExhausted> {
        Ok(())
    }
    fn read_static_data_from_heap(&mut self, _: usize) -> Result<(), ResourceExhausted> {
        Ok(())
    }
    fn write_static_data_to_heap(&mut self, _: usize) -> Result<(), ResourceExhausted> {
        Ok(())
    }
    fn read_one_instance_from_heap(&mut self, _: usize) -> Result<(), ResourceExhausted> {
        Ok(())
    }
    fn write_one_instance_to_heap(&mut self, _: usize) -> Result<(), ResourceExhausted> {
        Ok(())
    }
}

/// Per-record base cost plus a per-byte cost, for each direction of traffic.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeeSchedule {
    pub storage_read_base: u64,
    pub storage_read_byte: u64,
    pub storage_write_base: u64,
    pub storage_write_byte: u64,
    pub heap_base: u64,
    pub heap_byte: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            storage_read_base: FEE_STORAGE_READ_BASE,
            storage_read_byte: FEE_STORAGE_READ_BYTE,
            storage_write_base: FEE_STORAGE_WRITE_BASE,
            storage_write_byte: FEE_STORAGE_WRITE_BYTE,
            heap_base: FEE_HEAP_BASE,
            heap_byte: FEE_HEAP_BYTE,
        }
    }
}

/// Debits a fixed energy budget. Once a charge is refused nothing more is debited, so `used`
/// never exceeds `limit`.
pub struct EnergyFees {
    schedule: FeeSchedule,
    limit: u64,
    used: u64,
}

impl EnergyFees {
    pub fn new(limit: u64, schedule: FeeSchedule) -> Self {
        Self {
            schedule,
            limit,
            used: 0,
        }
    }

    pub fn shared(limit: u64, schedule: FeeSchedule) -> SharedFees {
        Arc::new(Mutex::new(Self::new(limit, schedule)))
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.used
    }

    fn charge(
        &mut self, base: u64, per_byte: u64, size: usize,
    ) -> Result<(), ResourceExhausted> {
        let cost = (size as u64)
            .checked_mul(per_byte)
            .and_then(|c| c.checked_add(base))
            .ok_or(ResourceExhausted)?;
        if cost > self.remaining() {
            return Err(ResourceExhausted)
        }
        self.used += cost;
        Ok(())
    }
}

impl StorageFeeProcessor for EnergyFees {
    fn read_static_data_from_storage(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted> {
        let s = &self.schedule;
        let (b, p) = (s.storage_read_base, s.storage_read_byte);
        self.charge(b, p, size)
    }

    fn write_static_data_to_storage(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted> {
        let s = &self.schedule;
        let (b, p) = (s.storage_write_base, s.storage_write_byte);
        self.charge(b, p, size)
    }

    fn read_one_instance_from_storage(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted> {
        self.read_static_data_from_storage(size)
    }

    fn write_one_instance_to_storage(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted> {
        self.write_static_data_to_storage(size)
    }

    fn read_static_data_from_heap(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted> {
        let (b, p) = (self.schedule.heap_base, self.schedule.heap_byte);
        self.charge(b, p, size)
    }

    fn write_static_data_to_heap(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted> {
        self.read_static_data_from_heap(size)
    }

    fn read_one_instance_from_heap(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted> {
        self.read_static_data_from_heap(size)
    }

    fn write_one_instance_to_heap(
        &mut self, size: usize,
    ) -> Result<(), ResourceExhausted> {
        self.read_static_data_from_heap(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_accounting() {
        let mut fees = EnergyFees::new(1_500, FeeSchedule::default());
        fees.read_one_instance_from_storage(100).unwrap();
        assert_eq!(fees.used(), FEE_STORAGE_READ_BASE + 100 * FEE_STORAGE_READ_BYTE);
        fees.write_one_instance_to_heap(10).unwrap();
        assert_eq!(fees.used(), 500 + FEE_HEAP_BASE + 10 * FEE_HEAP_BYTE);
        let before = fees.used();
        assert_eq!(
            fees.write_one_instance_to_storage(100),
            Err(ResourceExhausted)
        );
        assert_eq!(fees.used(), before);
        assert_eq!(fees.write_one_instance_to_storage(usize::MAX), Err(ResourceExhausted));
    }

    #[test]
    fn test_schedule_from_json() {
        let s: FeeSchedule =
            serde_json::from_str(r#"{"heapByte": 2, "storageWriteBase": 5}"#)
                .unwrap();
        assert_eq!(s.heap_byte, 2);
        assert_eq!(s.storage_write_base, 5);
        assert_eq!(s.storage_read_base, FEE_STORAGE_READ_BASE);
    }
}
