//! Counter set resolution
//!
//! Merges the built-in catalogs with an optional user catalog into the
//! [`CounterSet`] watched by one pipeline generation. Merging is by id and
//! first occurrence wins: built-in definitions are never overridden.
//!
//! The user catalog is a dcgm-exporter compatible CSV file:
//!
//! ```text
//! # Format: field name, kind (gauge, counter or label), help text
//! DCGM_FI_DEV_GPU_UTIL, gauge, GPU utilization (in %).
//! ```

use crate::catalog::{self, FieldOrigin};
use crate::error::AgentError;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;
use vigil_shared::{CounterSet, FieldId, MetricDefinition, MetricKind};

/// Resolve the counter set from the built-in catalogs and an optional user catalog.
///
/// A missing `user_catalog` yields exactly the built-in catalogs. A catalog
/// that cannot be read or parsed is a fatal `Config` error.
pub fn resolve(
    builtin_primary: &[MetricDefinition],
    builtin_exporter: &[MetricDefinition],
    user_catalog: Option<&Path>,
) -> Result<CounterSet, AgentError> {
    let mut candidate = match user_catalog {
        Some(path) => read_catalog(path)?,
        None => CounterSet::default(),
    };

    // labels must be available wherever exporter-added metrics render
    let labels: Vec<MetricDefinition> = candidate
        .primary
        .iter()
        .filter(|c| c.is_label())
        .cloned()
        .collect();
    candidate.exporter.extend(labels);

    Ok(merge(builtin_primary, builtin_exporter, candidate))
}

/// Merge `candidate` after the built-ins. The first occurrence of an id wins:
/// candidates repeating a built-in or an earlier candidate are dropped.
pub fn merge(
    builtin_primary: &[MetricDefinition],
    builtin_exporter: &[MetricDefinition],
    candidate: CounterSet,
) -> CounterSet {
    let builtin_ids: HashSet<FieldId> = builtin_primary.iter().map(|c| c.id).collect();

    let mut counters = CounterSet {
        primary: builtin_primary.to_vec(),
        exporter: builtin_exporter.to_vec(),
    };

    let mut seen = builtin_ids.clone();
    for counter in candidate.primary {
        // avoid adding duplicates
        if seen.insert(counter.id) {
            counters.primary.push(counter);
        } else {
            debug!("Ignoring user counter {} (id {}): already defined", counter.name, counter.id);
        }
    }

    let mut seen = builtin_ids;
    seen.extend(builtin_exporter.iter().map(|c| c.id));
    for counter in candidate.exporter {
        if seen.insert(counter.id) {
            counters.exporter.push(counter);
        } else {
            debug!(
                "Ignoring user exporter counter {} (id {}): already defined",
                counter.name, counter.id
            );
        }
    }

    counters
}

/// Read and parse a user catalog file
pub fn read_catalog(path: &Path) -> Result<CounterSet, AgentError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AgentError::config(format!("cannot read collectors file {}: {}", path.display(), e))
    })?;
    parse_catalog(&content)
        .map_err(|e| AgentError::config(format!("collectors file {}: {}", path.display(), e)))
}

/// Parse catalog text. Backend names go to `primary`, exporter-added names to `exporter`.
pub fn parse_catalog(content: &str) -> Result<CounterSet, String> {
    let mut counters = CounterSet::default();

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut columns = line.splitn(3, ',').map(str::trim);
        let name = columns.next().unwrap_or_default();
        let kind = columns
            .next()
            .ok_or_else(|| format!("line {}: expected `name, kind, help`", line_no))?;
        let help = columns
            .next()
            .ok_or_else(|| format!("line {}: missing help text for {}", line_no, name))?;

        let kind: MetricKind = kind
            .parse()
            .map_err(|e| format!("line {}: {}", line_no, e))?;

        match catalog::lookup(name) {
            Some(FieldOrigin::Backend(id)) => {
                counters.primary.push(MetricDefinition::new(id, name, kind, help))
            }
            Some(FieldOrigin::Exporter(id)) => {
                counters.exporter.push(MetricDefinition::new(id, name, kind, help))
            }
            None => return Err(format!("line {}: could not find field {:?}", line_no, name)),
        }
    }

    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn ids(defs: &[MetricDefinition]) -> Vec<FieldId> {
        defs.iter().map(|c| c.id).collect()
    }

    fn catalog_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_no_user_catalog_yields_builtins() {
        let counters = resolve(DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS, None).unwrap();
        assert_eq!(counters.primary, DEFAULT_COUNTERS.to_vec());
        assert_eq!(counters.exporter, DEFAULT_EXPORTER_COUNTERS.to_vec());
    }

    #[test]
    fn test_builtin_wins_on_duplicate_id() {
        let builtin = vec![
            MetricDefinition::new(100, "A", MetricKind::Gauge, "a"),
            MetricDefinition::new(101, "B", MetricKind::Gauge, "b"),
        ];
        let candidate = CounterSet {
            primary: vec![
                MetricDefinition::new(101, "B_RENAMED", MetricKind::Counter, "other"),
                MetricDefinition::new(200, "C", MetricKind::Gauge, "c"),
            ],
            exporter: vec![],
        };

        let counters = merge(&builtin, &[], candidate);
        assert_eq!(ids(&counters.primary), vec![100, 101, 200]);
        assert_eq!(counters.primary[1].name, "B");
        assert_eq!(counters.primary[1].kind, MetricKind::Gauge);
    }

    #[test]
    fn test_builtin_primary_ids_shadow_exporter_candidates() {
        let builtin = vec![MetricDefinition::new(1, "DCGM_FI_DRIVER_VERSION", MetricKind::Label, "v")];
        let candidate = CounterSet {
            primary: vec![],
            exporter: vec![
                MetricDefinition::new(1, "DCGM_FI_DRIVER_VERSION", MetricKind::Label, "v"),
                MetricDefinition::new(2, "DCGM_FI_NVML_VERSION", MetricKind::Label, "n"),
            ],
        };
        let counters = merge(&builtin, &[], candidate);
        assert_eq!(ids(&counters.exporter), vec![2]);
    }

    #[test]
    fn test_resolve_appends_user_fields_in_file_order() {
        let file = catalog_file(
            "# extra fields\n\
             DCGM_FI_DEV_GPU_UTIL, gauge, GPU utilization (in %).\n\
             \n\
             DCGM_FI_DEV_SM_CLOCK, counter, duplicate of a default\n\
             DCGM_FI_DEV_FB_FREE, gauge, Framebuffer memory free (in MiB).\n",
        );

        let counters =
            resolve(DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS, Some(file.path())).unwrap();

        let added: Vec<FieldId> = ids(&counters.primary)[DEFAULT_COUNTERS.len()..].to_vec();
        assert_eq!(added, vec![203, 251]);
        assert_eq!(counters.primary.len(), DEFAULT_COUNTERS.len() + 2);
    }

    #[test]
    fn test_resolve_copies_user_labels_to_exporter() {
        let file = catalog_file(
            "DCGM_FI_NVML_VERSION, label, NVML version\n\
             DCGM_FI_DRIVER_VERSION, label, already built in\n",
        );

        let counters =
            resolve(DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS, Some(file.path())).unwrap();

        assert!(counters.contains_primary(2));
        assert!(counters.contains_exporter(2));
        // id 1 is a built-in primary id, so its user copy is dropped from both lists
        assert_eq!(counters.exporter.iter().filter(|c| c.id == 1).count(), 0);
    }

    #[test]
    fn test_resolve_no_duplicate_ids() {
        let file = catalog_file(
            "DCGM_FI_DEV_GPU_UTIL, gauge, util\n\
             DCGM_EXP_XID_ERRORS_COUNT, gauge, xid\n\
             DCGM_FI_DEV_GPU_TEMP, gauge, temp\n",
        );
        let counters =
            resolve(DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS, Some(file.path())).unwrap();

        let primary: HashSet<FieldId> = ids(&counters.primary).into_iter().collect();
        assert_eq!(primary.len(), counters.primary.len());
        for builtin in DEFAULT_COUNTERS {
            assert!(primary.contains(&builtin.id));
        }
    }

    #[test]
    fn test_repeated_user_lines_appear_once() {
        let file = catalog_file(
            "DCGM_FI_DEV_GPU_UTIL, gauge, util\n\
             DCGM_FI_DEV_GPU_UTIL, counter, util again\n\
             DCGM_EXP_XID_ERRORS_COUNT, gauge, xid\n\
             DCGM_EXP_XID_ERRORS_COUNT, gauge, xid again\n",
        );
        let counters =
            resolve(DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS, Some(file.path())).unwrap();

        let utils: Vec<&MetricDefinition> =
            counters.primary.iter().filter(|c| c.id == 203).collect();
        assert_eq!(utils.len(), 1);
        assert_eq!(utils[0].kind, MetricKind::Gauge);
        assert_eq!(counters.exporter.iter().filter(|c| c.id == 9001).count(), 1);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let file = catalog_file("DCGM_FI_DEV_GPU_UTIL, gauge, util\nDCGM_FI_DEV_FB_USED, gauge, used\n");
        let first = resolve(DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS, Some(file.path())).unwrap();
        let second = resolve(DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS, Some(file.path())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_help_may_contain_commas() {
        let counters = parse_catalog("DCGM_FI_DEV_FB_USED, gauge, used, in MiB, total\n").unwrap();
        assert_eq!(counters.primary[0].help, "used, in MiB, total");
    }

    #[test]
    fn test_malformed_catalog_is_config_error() {
        for content in [
            "DCGM_FI_DEV_GPU_UTIL\n",
            "DCGM_FI_DEV_GPU_UTIL, histogram, util\n",
            "DCGM_FI_NOT_A_FIELD, gauge, nope\n",
        ] {
            let file = catalog_file(content);
            let err = resolve(DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS, Some(file.path()))
                .unwrap_err();
            assert!(matches!(err, AgentError::Config(_)), "{}", content);
        }
    }

    #[test]
    fn test_missing_catalog_file_is_config_error() {
        let err = resolve(
            DEFAULT_COUNTERS,
            DEFAULT_EXPORTER_COUNTERS,
            Some(Path::new("/nonexistent/vigil/counters.csv")),
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
