//! Perfdata record parsing
//!
//! One spool line is one record written by the monitoring host:
//!
//! ```text
//! DATATYPE::SERVICEPERFDATA<TAB>TIMET::1479723485<TAB>HOSTNAME::tsf-node-229
//!   <TAB>SERVICEDESC::Check_MK<TAB>SERVICEPERFDATA::execution_time=8.775 user_time=0.040
//!   <TAB>SERVICECHECKCOMMAND::check-mk<TAB>SERVICESTATE::OK ...
//! ```
//!
//! Host records (`DATATYPE::HOSTPERFDATA`) are attached to the `PING` service.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::units::convert_value;

/// Service name given to host-level records.
pub const HOST_SERVICE: &str = "PING";

const MANDATORY_ATTRS_COMMON: [&str; 3] = ["DATATYPE", "TIMET", "HOSTNAME"];
const MANDATORY_ATTRS_SERVICE: [&str; 2] = ["SERVICEDESC", "SERVICEPERFDATA"];
const MANDATORY_ATTRS_HOST: [&str; 1] = ["HOSTPERFDATA"];

/// Why a perfdata line was rejected
#[derive(Debug, thiserror::Error)]
pub enum PerfdataError {
    #[error("fail to parse perfdata: {0}")]
    MalformedLine(String),
    #[error("missing attribute {key} in {present:?}")]
    MissingAttribute { key: String, present: Vec<String> },
    #[error("unknown DATATYPE: {0}")]
    UnknownDatatype(String),
    #[error("TIMET malformed: {0}")]
    MalformedTimestamp(String),
    #[error("PERFDATA malformed: {0}")]
    MalformedPerfdata(String),
    #[error("unknown perfdata value/unit: '{0}'")]
    MalformedValue(String),
}

/// Raw `KEY::VALUE` pairs of one line
pub type PerfdataAttributes = HashMap<String, String>;

/// One timestamped value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measure {
    pub timestamp: String,
    pub value: f64,
}

/// A successfully parsed perfdata line
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub host: String,
    pub service: String,
    pub measures: BTreeMap<String, Measure>,
}

/// Splits a line into its attributes. Every token must contain `::`.
pub fn parse_attributes(line: &str) -> Result<PerfdataAttributes, PerfdataError> {
    line.split('\t')
        .map(|item| {
            item.split_once("::")
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| PerfdataError::MalformedLine(line.to_string()))
        })
        .collect()
}

fn check_attributes(attrs: &PerfdataAttributes, expected: &[&str]) -> Result<(), PerfdataError> {
    for key in expected {
        if !attrs.contains_key(*key) {
            let mut present: Vec<String> = attrs.keys().cloned().collect();
            present.sort();
            return Err(PerfdataError::MissingAttribute {
                key: key.to_string(),
                present,
            });
        }
    }
    Ok(())
}

/// Converts a `TIMET` epoch (integer or float seconds) to ISO-8601 UTC.
pub fn timet_to_iso8601(timet: &str) -> Option<String> {
    let epoch: f64 = timet.trim().parse().ok()?;
    if !epoch.is_finite() {
        return None;
    }
    let secs = epoch.floor();
    let nanos = ((epoch - secs) * 1e9).round().min(999_999_999.0) as u32;
    let ts = DateTime::<Utc>::from_timestamp(secs as i64, nanos)?;
    Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, false))
}

/// Parses the perfdata field (`metric=value[;warn;crit;min;max] ...`).
pub fn parse_measures(timet: &str, perfdata: &str) -> Result<BTreeMap<String, Measure>, PerfdataError> {
    if perfdata.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let timestamp = timet_to_iso8601(timet)
        .ok_or_else(|| PerfdataError::MalformedTimestamp(timet.to_string()))?;

    let mut measures = BTreeMap::new();
    for item in perfdata.split_whitespace() {
        let (metric, raw) = item
            .split_once('=')
            .ok_or_else(|| PerfdataError::MalformedPerfdata(perfdata.to_string()))?;
        let value = raw.split(';').next().unwrap_or_default();
        measures.insert(
            metric.to_string(),
            Measure {
                timestamp: timestamp.clone(),
                value: convert_value(value)?,
            },
        );
    }
    Ok(measures)
}

/// Parses one non-blank spool line.
pub fn parse_line(line: &str) -> Result<ParsedRecord, PerfdataError> {
    let attrs = parse_attributes(line)?;
    check_attributes(&attrs, &MANDATORY_ATTRS_COMMON)?;

    let (service, perfdata) = match attrs["DATATYPE"].as_str() {
        "HOSTPERFDATA" => {
            check_attributes(&attrs, &MANDATORY_ATTRS_HOST)?;
            (HOST_SERVICE.to_string(), &attrs["HOSTPERFDATA"])
        }
        "SERVICEPERFDATA" => {
            check_attributes(&attrs, &MANDATORY_ATTRS_SERVICE)?;
            (attrs["SERVICEDESC"].clone(), &attrs["SERVICEPERFDATA"])
        }
        other => return Err(PerfdataError::UnknownDatatype(other.to_string())),
    };

    Ok(ParsedRecord {
        host: attrs["HOSTNAME"].clone(),
        service,
        measures: parse_measures(&attrs["TIMET"], perfdata)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_line(host: &str, service: &str, timet: &str, perfdata: &str) -> String {
        format!(
            "DATATYPE::SERVICEPERFDATA\tTIMET::{}\tHOSTNAME::{}\tSERVICEDESC::{}\tSERVICEPERFDATA::{}\tSERVICECHECKCOMMAND::check-mk\tSERVICESTATE::OK",
            timet, host, service, perfdata
        )
    }

    #[test]
    fn test_service_perfdata_line() {
        let record = parse_line(&service_line("arn", "Uptime", "1479726660", "uptime=9175101.06;;;;")).unwrap();
        assert_eq!(record.host, "arn");
        assert_eq!(record.service, "Uptime");
        assert_eq!(record.measures.len(), 1);
        let uptime = &record.measures["uptime"];
        assert_eq!(uptime.value, 9175101.06);
        assert_eq!(uptime.timestamp, "2016-11-21T11:11:00+00:00");
    }

    #[test]
    fn test_host_perfdata_line_uses_ping_service() {
        let line = "DATATYPE::HOSTPERFDATA\tTIMET::1479723485\tHOSTNAME::tsf-node-229\tHOSTPERFDATA::rta=0.048ms;3000.000;5000.000;0; pl=0%;80;100;;\tHOSTSTATE::UP";
        let record = parse_line(line).unwrap();
        assert_eq!(record.service, HOST_SERVICE);
        assert!((record.measures["rta"].value - 48.0).abs() < 1e-9);
        assert_eq!(record.measures["pl"].value, 0.0);
    }

    #[test]
    fn test_multiple_measures_share_timestamp() {
        let line = service_line("tsf-node-229", "Check_MK", "1479723485", "execution_time=8.775 user_time=0.040 system_time=0.020");
        let record = parse_line(&line).unwrap();
        assert_eq!(record.measures.len(), 3);
        assert!(record.measures.values().all(|m| m.timestamp == "2016-11-21T10:18:05+00:00"));
    }

    #[test]
    fn test_empty_perfdata_yields_no_measures() {
        let record = parse_line(&service_line("arn", "Uptime", "1479726660", "")).unwrap();
        assert!(record.measures.is_empty());
    }

    #[test]
    fn test_token_without_separator_is_malformed() {
        let line = "DATATYPE::SERVICEPERFDATA\tTIMET 1479726660\tHOSTNAME::arn";
        assert!(matches!(parse_line(line), Err(PerfdataError::MalformedLine(_))));
    }

    #[test]
    fn test_missing_attributes() {
        let line = "DATATYPE::SERVICEPERFDATA\tTIMET::1479726660\tHOSTNAME::arn\tSERVICEDESC::Uptime";
        match parse_line(line) {
            Err(PerfdataError::MissingAttribute { key, .. }) => assert_eq!(key, "SERVICEPERFDATA"),
            other => panic!("unexpected result: {:?}", other),
        }

        let line = "DATATYPE::HOSTPERFDATA\tHOSTNAME::arn\tHOSTPERFDATA::rta=1";
        match parse_line(line) {
            Err(PerfdataError::MissingAttribute { key, .. }) => assert_eq!(key, "TIMET"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_datatype() {
        let line = "DATATYPE::EVENT\tTIMET::1479726660\tHOSTNAME::arn";
        match parse_line(line) {
            Err(PerfdataError::UnknownDatatype(dt)) => assert_eq!(dt, "EVENT"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_bad_timet_and_values() {
        let bad_timet = service_line("arn", "Uptime", "yesterday", "uptime=1");
        assert!(matches!(parse_line(&bad_timet), Err(PerfdataError::MalformedTimestamp(_))));

        let bad_value = service_line("arn", "Uptime", "1479726660", "uptime=abc;;;;");
        assert!(matches!(parse_line(&bad_value), Err(PerfdataError::MalformedValue(v)) if v == "abc"));

        let no_equal = service_line("arn", "Uptime", "1479726660", "uptime");
        assert!(matches!(parse_line(&no_equal), Err(PerfdataError::MalformedPerfdata(_))));
    }

    #[test]
    fn test_fractional_timet() {
        assert_eq!(timet_to_iso8601("1479726660.5").unwrap(), "2016-11-21T11:11:00.500+00:00");
        assert!(timet_to_iso8601("inf").is_none());
    }
}
