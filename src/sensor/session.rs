//! Measurement cycle against the particle counter.
//!
//! Register map of the counter:
//!
//! | Register | Kind | Meaning |
//! |---|---|---|
//! | 1 | holding | control: write 11 to start sampling, 12 to stop |
//! | 23 | holding | number of completed records |
//! | 24 | holding | record index selected for the data block |
//! | 0..100 | input | data block of the selected record |
//!
//! The record index must be set to `count - 1` before the data block is read,
//! otherwise the device serves a stale record.

use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::measurement::{Channel, ParticleCounts};
use crate::sensor::modbus::ModbusTcpClient;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Holding register that starts and stops sampling (40002).
pub const CONTROL_REGISTER: u16 = 1;
/// Value written to start sampling.
pub const START_COMMAND: u16 = 11;
/// Value written to stop sampling.
pub const STOP_COMMAND: u16 = 12;
/// Number of completed records (40024).
pub const RECORD_COUNT_REGISTER: u16 = 23;
/// Selects which record the data block shows (40025).
pub const RECORD_INDEX_REGISTER: u16 = 24;
/// First input register of the data block.
pub const DATA_BLOCK_START: u16 = 0;
/// Input registers read per record.
pub const DATA_BLOCK_LEN: u16 = 100;

/// Offset of a channel's count inside the data block.
pub fn input_offset(channel: Channel) -> usize {
    match channel {
        Channel::Um01 => 9,
        Channel::Um02 => 11,
        Channel::Um03 => 17,
        Channel::Um05 => 19,
        Channel::Um07 => 21,
        Channel::Um10 => 23,
    }
}

/// Extracts every channel from a data block.
pub fn parse_counts(block: &[u16]) -> Result<ParticleCounts, SensorError> {
    let mut counts = ParticleCounts::default();
    for channel in Channel::ALL {
        let value = block
            .get(input_offset(channel))
            .ok_or(SensorError::ShortRead {
                expected: usize::from(DATA_BLOCK_LEN),
                actual: block.len(),
            })?;
        counts.set(channel, u32::from(*value));
    }
    Ok(counts)
}

/// A particle counter.
#[async_trait]
pub trait ParticleSensor: Send + Sync {
    /// Whether a session can be opened right now.
    async fn is_connected(&self) -> bool;

    /// Start, dwell, stop and read the newest completed record.
    ///
    /// Fails as a whole: no partial counts are ever returned.
    async fn start_measurement_cycle(&self) -> Result<ParticleCounts, SensorError>;
}

/// Modbus-TCP implementation of [`ParticleSensor`].
pub struct SensorSession {
    settings: SensorConfig,
    // one cycle at a time; the device has a single control register
    cycle: Mutex<()>,
}

impl SensorSession {
    /// Session settings; nothing is opened until a cycle runs.
    pub fn new(settings: SensorConfig) -> Self {
        Self {
            settings,
            cycle: Mutex::new(()),
        }
    }

    async fn open(&self) -> Result<ModbusTcpClient, SensorError> {
        let client = ModbusTcpClient::connect(
            &self.settings.address(),
            self.settings.unit_id,
            self.settings.io_timeout(),
        )
        .await?;
        Ok(client)
    }

    /// Writes the stop command on a fresh session. Failures are only logged.
    pub async fn stop_measurement(&self) {
        let result = async {
            let mut client = self.open().await?;
            client
                .write_single_register(CONTROL_REGISTER, STOP_COMMAND)
                .await?;
            client.close().await;
            Ok::<_, SensorError>(())
        }
        .await;
        match result {
            Ok(()) => info!("Measurement stopped"),
            Err(err) => warn!(error = %err, "Could not stop measurement"),
        }
    }

    async fn run_cycle(&self, client: &mut ModbusTcpClient) -> Result<ParticleCounts, CycleFailure> {
        client
            .write_single_register(CONTROL_REGISTER, START_COMMAND)
            .await
            .map_err(|e| CycleFailure::before_start(e.into()))?;
        info!(dwell_secs = self.settings.dwell_secs, "Measurement started");

        tokio::time::sleep(self.settings.dwell()).await;

        client
            .write_single_register(CONTROL_REGISTER, STOP_COMMAND)
            .await
            .map_err(|e| CycleFailure::while_sampling(e.into()))?;
        debug!("Measurement stopped");

        let count = client
            .read_holding_registers(RECORD_COUNT_REGISTER, 1)
            .await
            .map_err(|e| CycleFailure::after_stop(e.into()))?
            .first()
            .copied()
            .unwrap_or(0);
        if count == 0 {
            return Err(CycleFailure::after_stop(SensorError::NoCompletedRecord));
        }
        client
            .write_single_register(RECORD_INDEX_REGISTER, count - 1)
            .await
            .map_err(|e| CycleFailure::after_stop(e.into()))?;

        let block = client
            .read_input_registers(DATA_BLOCK_START, DATA_BLOCK_LEN)
            .await
            .map_err(|e| CycleFailure::after_stop(e.into()))?;
        parse_counts(&block).map_err(CycleFailure::after_stop)
    }
}

/// A failed cycle and whether the device may still be sampling.
struct CycleFailure {
    error: SensorError,
    sampling: bool,
}

impl CycleFailure {
    fn before_start(error: SensorError) -> Self {
        Self {
            error,
            sampling: false,
        }
    }

    fn while_sampling(error: SensorError) -> Self {
        Self {
            error,
            sampling: true,
        }
    }

    fn after_stop(error: SensorError) -> Self {
        Self {
            error,
            sampling: false,
        }
    }
}

#[async_trait]
impl ParticleSensor for SensorSession {
    async fn is_connected(&self) -> bool {
        match self.open().await {
            Ok(client) => {
                client.close().await;
                true
            }
            Err(err) => {
                debug!(addr = %self.settings.address(), error = %err, "Sensor unreachable");
                false
            }
        }
    }

    async fn start_measurement_cycle(&self) -> Result<ParticleCounts, SensorError> {
        let _cycle = self.cycle.lock().await;
        let mut client = self.open().await?;

        match self.run_cycle(&mut client).await {
            Ok(counts) => {
                client.close().await;
                Ok(counts)
            }
            Err(failure) => {
                client.close().await;
                if failure.sampling {
                    self.stop_measurement().await;
                }
                Err(failure.error)
            }
        }
    }
}
