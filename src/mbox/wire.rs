//! Byte-exact mailbox payload codecs.
//!
//! Every multi-byte field on the wire is little-endian regardless of host
//! byte order, and every layout here mirrors the packed structs of the CXL
//! command set: offsets, reserved padding, and sentinel values are
//! normative. Decoders hand back raw field values; unit conversion and
//! "not implemented" sentinel translation stay with the callers.

use crate::error::{Error, Result};

/// Capacity fields are carried in multiples of 256 MiB.
pub const CXL_CAPACITY_MULTIPLIER: u64 = 256 << 20;

/// Device sentinel for an unimplemented 8-bit field.
pub const NOT_IMPL_U8: u8 = 0xff;
/// Device sentinel for an unimplemented 16-bit field.
pub const NOT_IMPL_U16: u16 = 0xffff;

fn check_len(buf: &[u8], need: usize, what: &str) -> Result<()> {
    if buf.len() < need {
        return Err(Error::Parse(format!(
            "{what}: payload too short ({} < {need})",
            buf.len()
        )));
    }
    Ok(())
}

fn rd_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn rd_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn rd_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn wr_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn wr_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn wr_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Trim a fixed-width firmware revision field to a string.
pub(crate) fn revision_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim_end().to_string()
}

// ============================================================================
// Identify (output, 67 bytes)
// ============================================================================

pub const IDENTIFY_FW_REV_LEN: usize = 0x10;

/// Identify Memory Device poison-handling capability bits.
pub const IDENTIFY_POISON_INJECTS_PERSISTENT: u8 = 1 << 0;
pub const IDENTIFY_POISON_SCANS_MEDIA: u8 = 1 << 1;
/// Identify Memory Device QoS telemetry capability bits.
pub const IDENTIFY_QOS_EGRESS_PORT_CONGESTION: u8 = 1 << 0;
pub const IDENTIFY_QOS_TEMPORARY_THROUGHPUT_REDUCTION: u8 = 1 << 1;

#[derive(Debug, Clone)]
pub struct IdentifyPayload {
    pub fw_revision: [u8; IDENTIFY_FW_REV_LEN],
    /// In 256 MiB units.
    pub total_capacity: u64,
    /// In 256 MiB units.
    pub volatile_only_capacity: u64,
    /// In 256 MiB units.
    pub persistent_only_capacity: u64,
    /// In 256 MiB units.
    pub partition_alignment: u64,
    pub info_event_log_size: u16,
    pub warning_event_log_size: u16,
    pub failure_event_log_size: u16,
    pub fatal_event_log_size: u16,
    pub lsa_size: u32,
    /// 24-bit count of poison list records.
    pub poison_list_max: u32,
    pub inject_poison_limit: u16,
    pub poison_caps: u8,
    pub qos_telemetry_caps: u8,
}

impl IdentifyPayload {
    pub const LEN: usize = 67;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "identify")?;
        let mut fw_revision = [0u8; IDENTIFY_FW_REV_LEN];
        fw_revision.copy_from_slice(&buf[..IDENTIFY_FW_REV_LEN]);
        Ok(IdentifyPayload {
            fw_revision,
            total_capacity: rd_u64(buf, 16),
            volatile_only_capacity: rd_u64(buf, 24),
            persistent_only_capacity: rd_u64(buf, 32),
            partition_alignment: rd_u64(buf, 40),
            info_event_log_size: rd_u16(buf, 48),
            warning_event_log_size: rd_u16(buf, 50),
            failure_event_log_size: rd_u16(buf, 52),
            fatal_event_log_size: rd_u16(buf, 54),
            lsa_size: rd_u32(buf, 56),
            poison_list_max: u32::from(buf[60])
                | u32::from(buf[61]) << 8
                | u32::from(buf[62]) << 16,
            inject_poison_limit: rd_u16(buf, 63),
            poison_caps: buf[65],
            qos_telemetry_caps: buf[66],
        })
    }
}

// ============================================================================
// Get Health Info (output, 18 bytes)
// ============================================================================

pub const HEALTH_STATUS_MAINTENANCE_NEEDED: u8 = 1 << 0;
pub const HEALTH_STATUS_PERFORMANCE_DEGRADED: u8 = 1 << 1;
pub const HEALTH_STATUS_HW_REPLACEMENT_NEEDED: u8 = 1 << 2;

pub const HEALTH_EXT_LIFE_USED_MASK: u8 = 0b0000_0011;
pub const HEALTH_EXT_TEMPERATURE_MASK: u8 = 0b0000_1100;
pub const HEALTH_EXT_TEMPERATURE_SHIFT: u8 = 2;
pub const HEALTH_EXT_CORRECTED_VOLATILE_MASK: u8 = 1 << 4;
pub const HEALTH_EXT_CORRECTED_PERSISTENT_MASK: u8 = 1 << 5;

#[derive(Debug, Clone, Copy)]
pub struct HealthInfoPayload {
    pub health_status: u8,
    pub media_status: u8,
    pub ext_status: u8,
    pub life_used: u8,
    pub temperature: u16,
    pub dirty_shutdowns: u32,
    pub volatile_errors: u32,
    pub pmem_errors: u32,
}

impl HealthInfoPayload {
    pub const LEN: usize = 18;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "health info")?;
        Ok(HealthInfoPayload {
            health_status: buf[0],
            media_status: buf[1],
            ext_status: buf[2],
            life_used: buf[3],
            temperature: rd_u16(buf, 4),
            dirty_shutdowns: rd_u32(buf, 6),
            volatile_errors: rd_u32(buf, 10),
            pmem_errors: rd_u32(buf, 14),
        })
    }
}

// ============================================================================
// Get / Set Alert Configuration (output 16 bytes / input 12 bytes)
// ============================================================================

/// Bit positions shared by the valid/programmable masks of Get Alert
/// Configuration and the action masks of Set Alert Configuration.
pub const ALERT_LIFE_USED: u8 = 1 << 0;
pub const ALERT_OVER_TEMPERATURE: u8 = 1 << 1;
pub const ALERT_UNDER_TEMPERATURE: u8 = 1 << 2;
pub const ALERT_CORRECTED_VOLATILE_ERR: u8 = 1 << 3;
pub const ALERT_CORRECTED_PMEM_ERR: u8 = 1 << 4;

#[derive(Debug, Clone, Copy)]
pub struct AlertConfigPayload {
    pub valid_alerts: u8,
    pub programmable_alerts: u8,
    pub life_used_crit_alert_threshold: u8,
    pub life_used_prog_warn_threshold: u8,
    pub dev_over_temperature_crit_alert_threshold: u16,
    pub dev_under_temperature_crit_alert_threshold: u16,
    pub dev_over_temperature_prog_warn_threshold: u16,
    pub dev_under_temperature_prog_warn_threshold: u16,
    pub corrected_volatile_mem_err_prog_warn_threshold: u16,
    pub corrected_pmem_err_prog_warn_threshold: u16,
}

impl AlertConfigPayload {
    pub const LEN: usize = 16;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "alert config")?;
        Ok(AlertConfigPayload {
            valid_alerts: buf[0],
            programmable_alerts: buf[1],
            life_used_crit_alert_threshold: buf[2],
            life_used_prog_warn_threshold: buf[3],
            dev_over_temperature_crit_alert_threshold: rd_u16(buf, 4),
            dev_under_temperature_crit_alert_threshold: rd_u16(buf, 6),
            dev_over_temperature_prog_warn_threshold: rd_u16(buf, 8),
            dev_under_temperature_prog_warn_threshold: rd_u16(buf, 10),
            corrected_volatile_mem_err_prog_warn_threshold: rd_u16(buf, 12),
            corrected_pmem_err_prog_warn_threshold: rd_u16(buf, 14),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetAlertConfigPayload {
    pub valid_alert_actions: u8,
    pub enable_alert_actions: u8,
    pub life_used_prog_warn_threshold: u8,
    pub dev_over_temperature_prog_warn_threshold: u16,
    pub dev_under_temperature_prog_warn_threshold: u16,
    pub corrected_volatile_mem_err_prog_warn_threshold: u16,
    pub corrected_pmem_err_prog_warn_threshold: u16,
}

impl SetAlertConfigPayload {
    pub const LEN: usize = 12;

    pub fn emit(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::LEN];
        buf[0] = self.valid_alert_actions;
        buf[1] = self.enable_alert_actions;
        buf[2] = self.life_used_prog_warn_threshold;
        wr_u16(&mut buf, 4, self.dev_over_temperature_prog_warn_threshold);
        wr_u16(&mut buf, 6, self.dev_under_temperature_prog_warn_threshold);
        wr_u16(&mut buf, 8, self.corrected_volatile_mem_err_prog_warn_threshold);
        wr_u16(&mut buf, 10, self.corrected_pmem_err_prog_warn_threshold);
        buf
    }
}

// ============================================================================
// Get / Set Partition Info (output 32 bytes / input 9 bytes)
// ============================================================================

pub const SET_PARTITION_IMMEDIATE: u8 = 1 << 0;

#[derive(Debug, Clone, Copy)]
pub struct PartitionInfoPayload {
    /// All four in 256 MiB units.
    pub active_volatile: u64,
    pub active_persistent: u64,
    pub next_volatile: u64,
    pub next_persistent: u64,
}

impl PartitionInfoPayload {
    pub const LEN: usize = 32;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "partition info")?;
        Ok(PartitionInfoPayload {
            active_volatile: rd_u64(buf, 0),
            active_persistent: rd_u64(buf, 8),
            next_volatile: rd_u64(buf, 16),
            next_persistent: rd_u64(buf, 24),
        })
    }
}

/// Set Partition Info input: volatile capacity in 256 MiB units plus the
/// immediate flag.
pub fn emit_set_partition(volatile_units: u64, flags: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 9];
    wr_u64(&mut buf, 0, volatile_units);
    buf[8] = flags;
    buf
}

// ============================================================================
// Get / Set LSA (input 8 bytes / input 8-byte header + data)
// ============================================================================

pub const SET_LSA_HEADER_LEN: usize = 8;

pub fn emit_get_lsa(offset: u32, length: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    wr_u32(&mut buf, 0, offset);
    wr_u32(&mut buf, 4, length);
    buf
}

pub fn emit_set_lsa(offset: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; SET_LSA_HEADER_LEN + data.len()];
    wr_u32(&mut buf, 0, offset);
    buf[SET_LSA_HEADER_LEN..].copy_from_slice(data);
    buf
}

// ============================================================================
// Get FW Info (output, 80 bytes) / Transfer FW / Activate FW
// ============================================================================

pub const FW_REV_LEN: usize = 0x10;
pub const FW_MAX_SLOTS: usize = 4;

pub const FW_INFO_SLOT_ACTIVE_MASK: u8 = 0b0000_0111;
pub const FW_INFO_SLOT_STAGED_MASK: u8 = 0b0011_1000;
pub const FW_INFO_SLOT_STAGED_SHIFT: u8 = 3;
pub const FW_INFO_ONLINE_ACTIVATION: u8 = 1 << 0;

#[derive(Debug, Clone)]
pub struct FwInfoPayload {
    pub slots_supported: u8,
    pub slot_info: u8,
    pub activation_caps: u8,
    pub revisions: [[u8; FW_REV_LEN]; FW_MAX_SLOTS],
}

impl FwInfoPayload {
    pub const LEN: usize = 80;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "fw info")?;
        let mut revisions = [[0u8; FW_REV_LEN]; FW_MAX_SLOTS];
        for (slot, rev) in revisions.iter_mut().enumerate() {
            let off = 16 + slot * FW_REV_LEN;
            rev.copy_from_slice(&buf[off..off + FW_REV_LEN]);
        }
        Ok(FwInfoPayload {
            slots_supported: buf[0],
            slot_info: buf[1],
            activation_caps: buf[2],
            revisions,
        })
    }
}

/// Transfer FW action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FwTransferAction {
    Full = 0,
    Initiate = 1,
    Continue = 2,
    End = 3,
    Abort = 4,
}

pub const TRANSFER_FW_HEADER_LEN: usize = 0x80;
/// Offsets and chunk boundaries of Transfer FW are in 128-byte units.
pub const FW_BLOCK_SIZE: usize = 0x80;

/// Transfer FW input: 0x80-byte header followed by the chunk data.
/// `offset` is in [`FW_BLOCK_SIZE`] units.
pub fn emit_transfer_fw(action: FwTransferAction, slot: u8, offset: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; TRANSFER_FW_HEADER_LEN + data.len()];
    buf[0] = action as u8;
    if !data.is_empty() {
        buf[1] = slot;
        wr_u32(&mut buf, 4, offset);
        buf[TRANSFER_FW_HEADER_LEN..].copy_from_slice(data);
    }
    buf
}

/// Activate FW input: action 0 activates online, 1 stages for the next
/// cold reset.
pub fn emit_activate_fw(online: bool, slot: u8) -> Vec<u8> {
    vec![u8::from(!online), slot]
}

// ============================================================================
// Timestamps / shutdown state / events
// ============================================================================

pub fn emit_timestamp(nanos: u64) -> Vec<u8> {
    nanos.to_le_bytes().to_vec()
}

pub fn parse_timestamp(buf: &[u8]) -> Result<u64> {
    check_len(buf, 8, "timestamp")?;
    Ok(rd_u64(buf, 0))
}

pub const SHUTDOWN_STATE_DIRTY: u8 = 1 << 0;

pub fn emit_shutdown_state(clean: bool) -> Vec<u8> {
    vec![u8::from(!clean)]
}

pub fn parse_shutdown_state(buf: &[u8]) -> Result<u8> {
    check_len(buf, 1, "shutdown state")?;
    Ok(buf[0])
}

/// Which event log a Get/Clear Event Records request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventLogType {
    Informational = 0,
    Warning = 1,
    Failure = 2,
    Fatal = 3,
}

pub fn emit_get_event_records(log: EventLogType) -> Vec<u8> {
    vec![log as u8]
}

pub const CLEAR_EVENT_ALL: u8 = 1 << 0;

/// Clear Event Records input (8 bytes): with `clear_all` the handle list
/// is empty, otherwise exactly one handle is named.
pub fn emit_clear_event_records(log: EventLogType, clear_all: bool, handle: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    buf[0] = log as u8;
    if clear_all {
        buf[1] = CLEAR_EVENT_ALL;
    } else {
        buf[2] = 1;
        wr_u16(&mut buf, 6, handle);
    }
    buf
}

pub const EVENT_MORE_RECORDS: u8 = 1 << 0;
pub const EVENT_RECORD_LEN: usize = 128;

/// Header of the Get Event Records output (32 bytes, records follow).
#[derive(Debug, Clone, Copy)]
pub struct EventRecordsHeader {
    pub flags: u8,
    pub overflow_err_count: u16,
    pub first_overflow_timestamp: u64,
    pub last_overflow_timestamp: u64,
    pub record_count: u16,
}

impl EventRecordsHeader {
    pub const LEN: usize = 32;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "event records")?;
        Ok(EventRecordsHeader {
            flags: buf[0],
            overflow_err_count: rd_u16(buf, 2),
            first_overflow_timestamp: rd_u64(buf, 4),
            last_overflow_timestamp: rd_u64(buf, 12),
            record_count: rd_u16(buf, 20),
        })
    }

    /// The record payloads following the header, bounded by both the
    /// declared count and the buffer length.
    pub fn records<'a>(&self, buf: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        buf[Self::LEN.min(buf.len())..]
            .chunks_exact(EVENT_RECORD_LEN)
            .take(self.record_count as usize)
    }
}

// ============================================================================
// Poison list / scan media
// ============================================================================

pub const POISON_ADDR_MASK: u64 = 0xFFFF_FFFF_FFFF_FFF8;
pub const POISON_SOURCE_MASK: u64 = 0x7;
/// Poison and scan-media lengths are in 64-byte units.
pub const POISON_LENGTH_UNIT: u64 = 64;

/// One media error record (16 bytes).
#[derive(Debug, Clone, Copy)]
pub struct MediaErrorRecord {
    pub dpa: u64,
    pub len: u32,
}

impl MediaErrorRecord {
    pub const LEN: usize = 16;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "media error record")?;
        Ok(MediaErrorRecord { dpa: rd_u64(buf, 0), len: rd_u32(buf, 8) })
    }

    /// Address with the source bits masked off.
    pub fn address(&self) -> u64 {
        self.dpa & POISON_ADDR_MASK
    }

    /// Source code carried in the low address bits.
    pub fn source(&self) -> u64 {
        self.dpa & POISON_SOURCE_MASK
    }
}

pub fn emit_poison_range(address: u64, length: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    wr_u64(&mut buf, 0, address);
    wr_u64(&mut buf, 8, length);
    buf
}

/// Inject Poison input (8 bytes): the device physical address.
pub fn emit_inject_poison(dpa: u64) -> Vec<u8> {
    dpa.to_le_bytes().to_vec()
}

pub const CLEAR_POISON_DATA_LEN: usize = 64;

/// Clear Poison input (72 bytes): the address plus the replacement data
/// for the cleared granule, zeroed here.
pub fn emit_clear_poison(dpa: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + CLEAR_POISON_DATA_LEN];
    wr_u64(&mut buf, 0, dpa);
    buf
}

/// Header of the Get Poison List output (32 bytes, records follow).
#[derive(Debug, Clone, Copy)]
pub struct PoisonListHeader {
    pub flags: u8,
    pub overflow_timestamp: u64,
    pub count: u16,
}

impl PoisonListHeader {
    pub const LEN: usize = 32;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "poison list")?;
        Ok(PoisonListHeader {
            flags: buf[0],
            overflow_timestamp: rd_u64(buf, 2),
            count: rd_u16(buf, 10),
        })
    }

    pub fn records<'a>(&self, buf: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        buf[Self::LEN.min(buf.len())..]
            .chunks_exact(MediaErrorRecord::LEN)
            .take(self.count as usize)
    }
}

/// Scan Media input (17 bytes): range plus a flag byte.
pub fn emit_scan_media(address: u64, length: u64, flags: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 17];
    wr_u64(&mut buf, 0, address);
    wr_u64(&mut buf, 8, length);
    buf[16] = flags;
    buf
}

pub const SCAN_MEDIA_MORE_RECORDS: u8 = 1 << 0;
pub const SCAN_MEDIA_STOPPED_PREMATURELY: u8 = 1 << 1;

/// Header of the Get Scan Media output (32 bytes, records follow).
#[derive(Debug, Clone, Copy)]
pub struct ScanMediaHeader {
    pub restart_address: u64,
    pub restart_length: u64,
    pub flags: u8,
    pub count: u16,
}

impl ScanMediaHeader {
    pub const LEN: usize = 32;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "scan media")?;
        Ok(ScanMediaHeader {
            restart_address: rd_u64(buf, 0),
            restart_length: rd_u64(buf, 8),
            flags: buf[16],
            count: rd_u16(buf, 18),
        })
    }

    pub fn records<'a>(&self, buf: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        buf[Self::LEN.min(buf.len())..]
            .chunks_exact(MediaErrorRecord::LEN)
            .take(self.count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_golden_bytes() {
        let mut buf = vec![0u8; IdentifyPayload::LEN];
        buf[..4].copy_from_slice(b"1.0\0");
        buf[16..24].copy_from_slice(&0x40u64.to_le_bytes()); // 16 GiB in units
        buf[24..32].copy_from_slice(&0x10u64.to_le_bytes());
        buf[32..40].copy_from_slice(&0x20u64.to_le_bytes());
        buf[40..48].copy_from_slice(&0x01u64.to_le_bytes());
        buf[48..50].copy_from_slice(&0x0100u16.to_le_bytes());
        buf[56..60].copy_from_slice(&0x20000u32.to_le_bytes());
        buf[60] = 0x34;
        buf[61] = 0x12;
        buf[63..65].copy_from_slice(&7u16.to_le_bytes());
        buf[65] = IDENTIFY_POISON_SCANS_MEDIA;
        buf[66] = IDENTIFY_QOS_EGRESS_PORT_CONGESTION;

        let id = IdentifyPayload::parse(&buf).unwrap();
        assert_eq!(revision_str(&id.fw_revision), "1.0");
        assert_eq!(id.total_capacity * CXL_CAPACITY_MULTIPLIER, 16 << 30);
        assert_eq!(id.volatile_only_capacity, 0x10);
        assert_eq!(id.persistent_only_capacity, 0x20);
        assert_eq!(id.partition_alignment, 1);
        assert_eq!(id.info_event_log_size, 0x100);
        assert_eq!(id.lsa_size, 0x20000);
        assert_eq!(id.poison_list_max, 0x1234);
        assert_eq!(id.inject_poison_limit, 7);
        assert_eq!(id.poison_caps & IDENTIFY_POISON_SCANS_MEDIA, IDENTIFY_POISON_SCANS_MEDIA);
        assert!(IdentifyPayload::parse(&buf[..66]).is_err());
    }

    #[test]
    fn health_info_golden_bytes() {
        let mut buf = vec![0u8; HealthInfoPayload::LEN];
        buf[0] = HEALTH_STATUS_MAINTENANCE_NEEDED | HEALTH_STATUS_HW_REPLACEMENT_NEEDED;
        buf[1] = 0x3; // data lost
        buf[2] = 0b0001_0110; // life warning, temp warning, volatile warning
        buf[3] = 42;
        buf[4..6].copy_from_slice(&300u16.to_le_bytes());
        buf[6..10].copy_from_slice(&5u32.to_le_bytes());
        buf[10..14].copy_from_slice(&17u32.to_le_bytes());
        buf[14..18].copy_from_slice(&3u32.to_le_bytes());

        let h = HealthInfoPayload::parse(&buf).unwrap();
        assert_eq!(h.health_status & HEALTH_STATUS_PERFORMANCE_DEGRADED, 0);
        assert_eq!(h.media_status, 3);
        assert_eq!(h.ext_status & HEALTH_EXT_LIFE_USED_MASK, 2);
        assert_eq!(
            (h.ext_status & HEALTH_EXT_TEMPERATURE_MASK) >> HEALTH_EXT_TEMPERATURE_SHIFT,
            1
        );
        assert_eq!(h.life_used, 42);
        assert_eq!(h.temperature, 300);
        assert_eq!(h.dirty_shutdowns, 5);
        assert_eq!(h.volatile_errors, 17);
        assert_eq!(h.pmem_errors, 3);
    }

    #[test]
    fn alert_config_round_trip_offsets() {
        let mut buf = vec![0u8; AlertConfigPayload::LEN];
        buf[0] = ALERT_LIFE_USED | ALERT_OVER_TEMPERATURE;
        buf[1] = ALERT_OVER_TEMPERATURE;
        buf[2] = 90;
        buf[3] = 75;
        buf[8..10].copy_from_slice(&85u16.to_le_bytes());
        let cfg = AlertConfigPayload::parse(&buf).unwrap();
        assert_eq!(cfg.valid_alerts & ALERT_LIFE_USED, ALERT_LIFE_USED);
        assert_eq!(cfg.life_used_crit_alert_threshold, 90);
        assert_eq!(cfg.dev_over_temperature_prog_warn_threshold, 85);

        let set = SetAlertConfigPayload {
            valid_alert_actions: ALERT_OVER_TEMPERATURE,
            enable_alert_actions: ALERT_OVER_TEMPERATURE,
            dev_over_temperature_prog_warn_threshold: 85,
            ..Default::default()
        };
        let out = set.emit();
        assert_eq!(out.len(), SetAlertConfigPayload::LEN);
        assert_eq!(out[0], ALERT_OVER_TEMPERATURE);
        assert_eq!(out[1], ALERT_OVER_TEMPERATURE);
        assert_eq!(&out[4..6], &85u16.to_le_bytes());
    }

    #[test]
    fn partition_payloads() {
        let mut buf = vec![0u8; PartitionInfoPayload::LEN];
        buf[0..8].copy_from_slice(&4u64.to_le_bytes());
        buf[8..16].copy_from_slice(&2u64.to_le_bytes());
        buf[16..24].copy_from_slice(&3u64.to_le_bytes());
        buf[24..32].copy_from_slice(&3u64.to_le_bytes());
        let p = PartitionInfoPayload::parse(&buf).unwrap();
        assert_eq!(p.active_volatile * CXL_CAPACITY_MULTIPLIER, 1 << 30);
        assert_eq!(p.next_volatile, 3);

        let set = emit_set_partition(4, SET_PARTITION_IMMEDIATE);
        assert_eq!(set.len(), 9);
        assert_eq!(&set[0..8], &4u64.to_le_bytes());
        assert_eq!(set[8], 1);
    }

    #[test]
    fn lsa_payloads() {
        let get = emit_get_lsa(0x100, 0x80);
        assert_eq!(&get[0..4], &0x100u32.to_le_bytes());
        assert_eq!(&get[4..8], &0x80u32.to_le_bytes());

        let set = emit_set_lsa(0x40, &[0xaa, 0xbb]);
        assert_eq!(set.len(), SET_LSA_HEADER_LEN + 2);
        assert_eq!(&set[0..4], &0x40u32.to_le_bytes());
        assert_eq!(&set[4..8], &[0, 0, 0, 0]);
        assert_eq!(&set[8..], &[0xaa, 0xbb]);
    }

    #[test]
    fn fw_payloads() {
        let mut buf = vec![0u8; FwInfoPayload::LEN];
        buf[0] = 3;
        buf[1] = 0b0001_0010; // active slot 2, staged slot 2
        buf[2] = FW_INFO_ONLINE_ACTIVATION;
        buf[16..20].copy_from_slice(b"v1.1");
        buf[32..36].copy_from_slice(b"v1.2");
        let fw = FwInfoPayload::parse(&buf).unwrap();
        assert_eq!(fw.slots_supported, 3);
        assert_eq!(fw.slot_info & FW_INFO_SLOT_ACTIVE_MASK, 2);
        assert_eq!((fw.slot_info & FW_INFO_SLOT_STAGED_MASK) >> FW_INFO_SLOT_STAGED_SHIFT, 2);
        assert_eq!(revision_str(&fw.revisions[1]), "v1.2");

        let data = [0u8; 0x100];
        let xfer = emit_transfer_fw(FwTransferAction::Continue, 2, 8, &data);
        assert_eq!(xfer.len(), TRANSFER_FW_HEADER_LEN + 0x100);
        assert_eq!(xfer[0], 2);
        assert_eq!(xfer[1], 2);
        assert_eq!(&xfer[4..8], &8u32.to_le_bytes());

        // An END with no data leaves slot and offset zeroed.
        let end = emit_transfer_fw(FwTransferAction::Abort, 2, 8, &[]);
        assert_eq!(end[1], 0);
        assert_eq!(&end[4..8], &[0, 0, 0, 0]);

        assert_eq!(emit_activate_fw(true, 2), vec![0, 2]);
        assert_eq!(emit_activate_fw(false, 1), vec![1, 1]);
    }

    #[test]
    fn event_and_shutdown_payloads() {
        assert_eq!(emit_shutdown_state(true), vec![0]);
        assert_eq!(emit_shutdown_state(false), vec![1]);
        assert_eq!(parse_shutdown_state(&[1]).unwrap() & SHUTDOWN_STATE_DIRTY, 1);

        assert_eq!(emit_get_event_records(EventLogType::Fatal), vec![3]);

        let all = emit_clear_event_records(EventLogType::Warning, true, 0);
        assert_eq!(all, vec![1, CLEAR_EVENT_ALL, 0, 0, 0, 0, 0, 0]);
        let one = emit_clear_event_records(EventLogType::Warning, false, 0x1234);
        assert_eq!(one, vec![1, 0, 1, 0, 0, 0, 0x34, 0x12]);

        let mut buf = vec![0u8; EventRecordsHeader::LEN + 2 * EVENT_RECORD_LEN];
        buf[0] = EVENT_MORE_RECORDS;
        buf[2..4].copy_from_slice(&1u16.to_le_bytes());
        buf[20..22].copy_from_slice(&2u16.to_le_bytes());
        let hdr = EventRecordsHeader::parse(&buf).unwrap();
        assert_eq!(hdr.record_count, 2);
        assert_eq!(hdr.records(&buf).count(), 2);
    }

    #[test]
    fn poison_and_scan_media_payloads() {
        let req = emit_poison_range(0x4000, 2);
        assert_eq!(&req[0..8], &0x4000u64.to_le_bytes());
        assert_eq!(&req[8..16], &2u64.to_le_bytes());

        let mut buf = vec![0u8; PoisonListHeader::LEN + MediaErrorRecord::LEN];
        buf[10..12].copy_from_slice(&1u16.to_le_bytes());
        buf[32..40].copy_from_slice(&(0x4000u64 | 3).to_le_bytes());
        buf[40..44].copy_from_slice(&1u32.to_le_bytes());
        let hdr = PoisonListHeader::parse(&buf).unwrap();
        assert_eq!(hdr.count, 1);
        let rec = MediaErrorRecord::parse(hdr.records(&buf).next().unwrap()).unwrap();
        assert_eq!(rec.address(), 0x4000);
        assert_eq!(rec.source(), 3); // injected
        assert_eq!(rec.len, 1);

        assert_eq!(emit_inject_poison(0x2000), 0x2000u64.to_le_bytes().to_vec());
        let clear = emit_clear_poison(0x2000);
        assert_eq!(clear.len(), 8 + CLEAR_POISON_DATA_LEN);
        assert_eq!(&clear[0..8], &0x2000u64.to_le_bytes());
        assert!(clear[8..].iter().all(|&b| b == 0));

        let scan = emit_scan_media(0x1000, 4, 1);
        assert_eq!(scan.len(), 17);
        assert_eq!(scan[16], 1);

        let mut out = vec![0u8; ScanMediaHeader::LEN];
        out[0..8].copy_from_slice(&0x8000u64.to_le_bytes());
        out[16] = SCAN_MEDIA_STOPPED_PREMATURELY;
        let sm = ScanMediaHeader::parse(&out).unwrap();
        assert_eq!(sm.restart_address, 0x8000);
        assert_ne!(sm.flags & SCAN_MEDIA_STOPPED_PREMATURELY, 0);
        assert_eq!(sm.count, 0);
    }
}
