//! Built-in metric catalogs and the field-name table
//!
//! The default primary set is always monitored; user catalogs can add to it
//! but never override an entry. For all backend field ids see
//! <https://docs.nvidia.com/datacenter/dcgm/latest/dcgm-api/dcgm-api-field-ids.html>.

use vigil_shared::{FieldId, MetricDefinition, MetricKind};

use vigil_shared::MetricKind::{Counter, Gauge, Label};

pub const DRIVER_VERSION: FieldId = 1;
pub const CLOCK_THROTTLE_REASONS: FieldId = 112;
pub const XID_ERRORS: FieldId = 230;

/// Exporter-added: count of XID errors within the window
pub const XID_ERRORS_COUNT: FieldId = 9001;
/// Exporter-added: count of clock events within the window
pub const CLOCK_EVENTS_COUNT: FieldId = 9002;

const fn def(id: FieldId, name: &'static str, kind: MetricKind, help: &'static str) -> MetricDefinition {
    MetricDefinition::builtin(id, name, kind, help)
}

/// Default backend fields, in fixed catalog order
pub static DEFAULT_COUNTERS: &[MetricDefinition] = &[
    def(DRIVER_VERSION, "DCGM_FI_DRIVER_VERSION", Label, "The NVIDIA driver version."),
    def(66, "DCGM_FI_DEV_PERSISTENCE_MODE", Gauge, "Persistence mode for the device Boolean: 0 is disabled 1 is enabled"),
    def(100, "DCGM_FI_DEV_SM_CLOCK", Gauge, "SM clock frequency (in MHz)."),
    def(101, "DCGM_FI_DEV_MEM_CLOCK", Gauge, "Memory clock frequency (in MHz)."),
    // read by the clock events collector
    def(CLOCK_THROTTLE_REASONS, "DCGM_FI_DEV_CLOCK_THROTTLE_REASONS", Gauge, "Current clock throttle reasons (bitmask of DCGM_CLOCKS_THROTTLE_REASON_*)"),
    def(140, "DCGM_FI_DEV_MEMORY_TEMP", Gauge, "Memory temperature (in C)."),
    def(150, "DCGM_FI_DEV_GPU_TEMP", Gauge, "GPU temperature (in C)."),
    def(155, "DCGM_FI_DEV_POWER_USAGE", Gauge, "Power draw (in W)."),
    def(158, "DCGM_FI_DEV_SLOWDOWN_TEMP", Gauge, "GPU Slowdown temperature."),
    def(159, "DCGM_FI_DEV_SHUTDOWN_TEMP", Gauge, "GPU Shutdown temperature."),
    def(190, "DCGM_FI_DEV_FAN_SPEED", Gauge, "Fan speed for the device in percent 0-100"),
    def(191, "DCGM_FI_DEV_PSTATE", Gauge, "GPU Performance state (P-State) 0-15. 0=highest."),
    // PCIe
    def(202, "DCGM_FI_DEV_PCIE_REPLAY_COUNTER", Counter, "Total number of PCIe retries."),
    // Encoder/Decoder utilization
    def(206, "DCGM_FI_DEV_ENC_UTIL", Gauge, "Encoder utilization (in %)."),
    def(207, "DCGM_FI_DEV_DEC_UTIL", Gauge, "Decoder utilization (in %)."),
    // read by the XID errors collector
    def(XID_ERRORS, "DCGM_FI_DEV_XID_ERRORS", Gauge, "Value of the last XID error encountered."),
    // Errors and violations
    def(240, "DCGM_FI_DEV_THERMAL_VIOLATION", Counter, "Throttling duration due to thermal constraints (in us)."),
    def(241, "DCGM_FI_DEV_POWER_VIOLATION", Counter, "Throttling duration due to power constraints (in us)."),
    def(242, "DCGM_FI_DEV_SYNC_BOOST_VIOLATION", Counter, "Throttling duration due to sync-boost constraints (in us)."),
    def(243, "DCGM_FI_DEV_BOARD_LIMIT_VIOLATION", Counter, "Throttling duration due to board limit constraints (in us)."),
    def(244, "DCGM_FI_DEV_LOW_UTIL_VIOLATION", Counter, "Throttling duration due to low utilization (in us)."),
    def(245, "DCGM_FI_DEV_RELIABILITY_VIOLATION", Counter, "Throttling duration due to reliability constraints (in us)."),
    // Memory usage
    def(254, "DCGM_FI_DEV_FB_USED_PERCENT", Gauge, "Percentage used of Frame Buffer: 'Used/(Total - Reserved)'. Range 0.0-1.0"),
    // ECC errors
    def(310, "DCGM_FI_DEV_ECC_SBE_VOL_TOTAL", Counter, "Total number of single-bit volatile ECC errors."),
    def(311, "DCGM_FI_DEV_ECC_DBE_VOL_TOTAL", Counter, "Total number of double-bit volatile ECC errors."),
    def(312, "DCGM_FI_DEV_ECC_SBE_AGG_TOTAL", Counter, "Total number of single-bit persistent ECC errors."),
    def(313, "DCGM_FI_DEV_ECC_DBE_AGG_TOTAL", Counter, "Total number of double-bit persistent ECC errors."),
    def(390, "DCGM_FI_DEV_RETIRED_SBE", Counter, "Number of retired pages because of single bit errors Note: monotonically increasing"),
    def(391, "DCGM_FI_DEV_RETIRED_DBE", Counter, "Number of retired pages because of double bit errors Note: monotonically increasing"),
    // Remapped rows
    def(393, "DCGM_FI_DEV_UNCORRECTABLE_REMAPPED_ROWS", Counter, "Number of remapped rows for uncorrectable errors"),
    def(394, "DCGM_FI_DEV_CORRECTABLE_REMAPPED_ROWS", Counter, "Number of remapped rows for correctable errors"),
    def(395, "DCGM_FI_DEV_ROW_REMAP_FAILURE", Gauge, "Whether remapping of rows has failed"),
    // NVLink
    def(409, "DCGM_FI_DEV_NVLINK_CRC_FLIT_ERROR_COUNT_TOTAL", Counter, "Total number of NVLink flow-control CRC errors."),
    def(419, "DCGM_FI_DEV_NVLINK_CRC_DATA_ERROR_COUNT_TOTAL", Counter, "Total number of NVLink data CRC errors."),
    def(429, "DCGM_FI_DEV_NVLINK_REPLAY_ERROR_COUNT_TOTAL", Counter, "Total number of NVLink retries."),
    def(439, "DCGM_FI_DEV_NVLINK_RECOVERY_ERROR_COUNT_TOTAL", Counter, "Total number of NVLink recovery errors."),
    def(449, "DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL", Counter, "Total number of NVLink bandwidth counters for all lanes"),
    // NVSwitch
    def(856, "DCGM_FI_DEV_NVSWITCH_FATAL_ERRORS", Counter, "NVSwitch fatal error information. Note: value field indicates the specific SXid reported"),
    def(857, "DCGM_FI_DEV_NVSWITCH_NON_FATAL_ERRORS", Counter, "NVSwitch non-fatal error information. Note: value field indicates the specific SXid reported"),
    def(858, "DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT", Gauge, "NVSwitch current temperature."),
    def(859, "DCGM_FI_DEV_NVSWITCH_TEMPERATURE_LIMIT_SLOWDOWN", Gauge, "NVSwitch limit slowdown temperature."),
    def(860, "DCGM_FI_DEV_NVSWITCH_TEMPERATURE_LIMIT_SHUTDOWN", Gauge, "NVSwitch limit shutdown temperature."),
    def(861, "DCGM_FI_DEV_NVSWITCH_THROUGHPUT_TX", Gauge, "NVSwitch throughput Tx."),
    def(862, "DCGM_FI_DEV_NVSWITCH_THROUGHPUT_RX", Gauge, "NVSwitch throughput Rx."),
    def(870, "DCGM_FI_DEV_NVSWITCH_LINK_STATUS", Gauge, "NvLink status {UNKNOWN:-1 OFF:0 SAFE:1 ACTIVE:2 ERROR:3 INACTIVE: 4}"),
    // Profiling
    def(1001, "DCGM_FI_PROF_GR_ENGINE_ACTIVE", Gauge, "Ratio of time the graphics engine is active."),
    def(1002, "DCGM_FI_PROF_SM_ACTIVE", Gauge, "The ratio of cycles an SM has at least 1 warp assigned."),
    def(1003, "DCGM_FI_PROF_SM_OCCUPANCY", Gauge, "The ratio of number of warps resident on an SM."),
    def(1004, "DCGM_FI_PROF_PIPE_TENSOR_ACTIVE", Gauge, "Ratio of cycles the tensor (HMMA) pipe is active."),
    def(1005, "DCGM_FI_PROF_DRAM_ACTIVE", Gauge, "The ratio of cycles the device memory interface is active sending or receiving data."),
    def(1006, "DCGM_FI_PROF_PIPE_FP64_ACTIVE", Gauge, "Ratio of cycles the fp64 pipes are active."),
    def(1007, "DCGM_FI_PROF_PIPE_FP32_ACTIVE", Gauge, "Ratio of cycles the fp32 pipes are active."),
    def(1008, "DCGM_FI_PROF_PIPE_FP16_ACTIVE", Gauge, "Ratio of cycles the fp16 pipes are active."),
    def(1009, "DCGM_FI_PROF_PCIE_TX_BYTES", Gauge, "The rate of data transmitted over the PCIe bus - including both protocol headers and data payloads - in bytes per second."),
    def(1010, "DCGM_FI_PROF_PCIE_RX_BYTES", Gauge, "The rate of data received over the PCIe bus - including both protocol headers and data payloads - in bytes per second."),
    def(1011, "DCGM_FI_PROF_NVLINK_TX_BYTES", Gauge, "The rate of data transmitted over NVLink not including protocol headers in bytes per second"),
    def(1012, "DCGM_FI_PROF_NVLINK_RX_BYTES", Gauge, "The rate of data received over NVLink not including protocol headers in bytes per second"),
];

/// Metrics synthesized by the agent that are not backend fields
pub static DEFAULT_EXPORTER_COUNTERS: &[MetricDefinition] = &[
    def(XID_ERRORS_COUNT, "DCGM_EXP_XID_ERRORS_COUNT", Gauge, "Count of XID errors within a 20s time window"),
    def(CLOCK_EVENTS_COUNT, "DCGM_EXP_CLOCK_EVENTS_COUNT", Gauge, "Count of clock events within a 20s time window."),
];

/// Backend field names accepted in user catalogs
static FIELD_IDS: &[(&str, FieldId)] = &[
    ("DCGM_FI_DRIVER_VERSION", 1),
    ("DCGM_FI_NVML_VERSION", 2),
    ("DCGM_FI_DEV_NAME", 50),
    ("DCGM_FI_DEV_BRAND", 51),
    ("DCGM_FI_DEV_SERIAL", 53),
    ("DCGM_FI_DEV_UUID", 54),
    ("DCGM_FI_DEV_MINOR_NUMBER", 55),
    ("DCGM_FI_DEV_PCI_BUSID", 57),
    ("DCGM_FI_DEV_PERSISTENCE_MODE", 66),
    ("DCGM_FI_DEV_SM_CLOCK", 100),
    ("DCGM_FI_DEV_MEM_CLOCK", 101),
    ("DCGM_FI_DEV_VIDEO_CLOCK", 102),
    ("DCGM_FI_DEV_APP_SM_CLOCK", 110),
    ("DCGM_FI_DEV_APP_MEM_CLOCK", 111),
    ("DCGM_FI_DEV_CLOCK_THROTTLE_REASONS", 112),
    ("DCGM_FI_DEV_MAX_SM_CLOCK", 113),
    ("DCGM_FI_DEV_MAX_MEM_CLOCK", 114),
    ("DCGM_FI_DEV_MEMORY_TEMP", 140),
    ("DCGM_FI_DEV_GPU_TEMP", 150),
    ("DCGM_FI_DEV_POWER_USAGE", 155),
    ("DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION", 156),
    ("DCGM_FI_DEV_SLOWDOWN_TEMP", 158),
    ("DCGM_FI_DEV_SHUTDOWN_TEMP", 159),
    ("DCGM_FI_DEV_POWER_MGMT_LIMIT", 160),
    ("DCGM_FI_DEV_FAN_SPEED", 190),
    ("DCGM_FI_DEV_PSTATE", 191),
    ("DCGM_FI_DEV_PCIE_TX_THROUGHPUT", 200),
    ("DCGM_FI_DEV_PCIE_RX_THROUGHPUT", 201),
    ("DCGM_FI_DEV_PCIE_REPLAY_COUNTER", 202),
    ("DCGM_FI_DEV_GPU_UTIL", 203),
    ("DCGM_FI_DEV_MEM_COPY_UTIL", 204),
    ("DCGM_FI_DEV_ENC_UTIL", 206),
    ("DCGM_FI_DEV_DEC_UTIL", 207),
    ("DCGM_FI_DEV_XID_ERRORS", 230),
    ("DCGM_FI_DEV_THERMAL_VIOLATION", 240),
    ("DCGM_FI_DEV_POWER_VIOLATION", 241),
    ("DCGM_FI_DEV_SYNC_BOOST_VIOLATION", 242),
    ("DCGM_FI_DEV_BOARD_LIMIT_VIOLATION", 243),
    ("DCGM_FI_DEV_LOW_UTIL_VIOLATION", 244),
    ("DCGM_FI_DEV_RELIABILITY_VIOLATION", 245),
    ("DCGM_FI_DEV_FB_TOTAL", 250),
    ("DCGM_FI_DEV_FB_FREE", 251),
    ("DCGM_FI_DEV_FB_USED", 252),
    ("DCGM_FI_DEV_FB_RESERVED", 253),
    ("DCGM_FI_DEV_FB_USED_PERCENT", 254),
    ("DCGM_FI_DEV_ECC_SBE_VOL_TOTAL", 310),
    ("DCGM_FI_DEV_ECC_DBE_VOL_TOTAL", 311),
    ("DCGM_FI_DEV_ECC_SBE_AGG_TOTAL", 312),
    ("DCGM_FI_DEV_ECC_DBE_AGG_TOTAL", 313),
    ("DCGM_FI_DEV_RETIRED_SBE", 390),
    ("DCGM_FI_DEV_RETIRED_DBE", 391),
    ("DCGM_FI_DEV_RETIRED_PENDING", 392),
    ("DCGM_FI_DEV_UNCORRECTABLE_REMAPPED_ROWS", 393),
    ("DCGM_FI_DEV_CORRECTABLE_REMAPPED_ROWS", 394),
    ("DCGM_FI_DEV_ROW_REMAP_FAILURE", 395),
    ("DCGM_FI_DEV_NVLINK_CRC_FLIT_ERROR_COUNT_TOTAL", 409),
    ("DCGM_FI_DEV_NVLINK_CRC_DATA_ERROR_COUNT_TOTAL", 419),
    ("DCGM_FI_DEV_NVLINK_REPLAY_ERROR_COUNT_TOTAL", 429),
    ("DCGM_FI_DEV_NVLINK_RECOVERY_ERROR_COUNT_TOTAL", 439),
    ("DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL", 449),
    ("DCGM_FI_DEV_NVSWITCH_FATAL_ERRORS", 856),
    ("DCGM_FI_DEV_NVSWITCH_NON_FATAL_ERRORS", 857),
    ("DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT", 858),
    ("DCGM_FI_DEV_NVSWITCH_TEMPERATURE_LIMIT_SLOWDOWN", 859),
    ("DCGM_FI_DEV_NVSWITCH_TEMPERATURE_LIMIT_SHUTDOWN", 860),
    ("DCGM_FI_DEV_NVSWITCH_THROUGHPUT_TX", 861),
    ("DCGM_FI_DEV_NVSWITCH_THROUGHPUT_RX", 862),
    ("DCGM_FI_DEV_NVSWITCH_LINK_STATUS", 870),
    ("DCGM_FI_PROF_GR_ENGINE_ACTIVE", 1001),
    ("DCGM_FI_PROF_SM_ACTIVE", 1002),
    ("DCGM_FI_PROF_SM_OCCUPANCY", 1003),
    ("DCGM_FI_PROF_PIPE_TENSOR_ACTIVE", 1004),
    ("DCGM_FI_PROF_DRAM_ACTIVE", 1005),
    ("DCGM_FI_PROF_PIPE_FP64_ACTIVE", 1006),
    ("DCGM_FI_PROF_PIPE_FP32_ACTIVE", 1007),
    ("DCGM_FI_PROF_PIPE_FP16_ACTIVE", 1008),
    ("DCGM_FI_PROF_PCIE_TX_BYTES", 1009),
    ("DCGM_FI_PROF_PCIE_RX_BYTES", 1010),
    ("DCGM_FI_PROF_NVLINK_TX_BYTES", 1011),
    ("DCGM_FI_PROF_NVLINK_RX_BYTES", 1012),
];

/// Exporter-added names accepted in user catalogs
static EXPORTER_IDS: &[(&str, FieldId)] = &[
    ("DCGM_EXP_XID_ERRORS_COUNT", XID_ERRORS_COUNT),
    ("DCGM_EXP_CLOCK_EVENTS_COUNT", CLOCK_EVENTS_COUNT),
];

/// Where a catalog name lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrigin {
    Backend(FieldId),
    Exporter(FieldId),
}

/// Resolve a catalog name to its id
pub fn lookup(name: &str) -> Option<FieldOrigin> {
    if let Some((_, id)) = FIELD_IDS.iter().find(|(n, _)| *n == name) {
        return Some(FieldOrigin::Backend(*id));
    }
    EXPORTER_IDS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, id)| FieldOrigin::Exporter(*id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_catalog_ids_are_unique_and_ordered() {
        let ids: Vec<FieldId> = DEFAULT_COUNTERS.iter().map(|c| c.id).collect();
        let unique: HashSet<FieldId> = ids.iter().copied().collect();
        assert_eq!(ids.len(), unique.len());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_every_default_counter_has_a_known_name() {
        for counter in DEFAULT_COUNTERS {
            assert_eq!(
                lookup(&counter.name),
                Some(FieldOrigin::Backend(counter.id)),
                "{}",
                counter.name
            );
        }
        for counter in DEFAULT_EXPORTER_COUNTERS {
            assert_eq!(lookup(&counter.name), Some(FieldOrigin::Exporter(counter.id)));
        }
    }

    #[test]
    fn test_lookup_unknown() {
        assert_eq!(lookup("DCGM_FI_DOES_NOT_EXIST"), None);
    }
}
