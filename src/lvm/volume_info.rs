use std::path::PathBuf;

use nom::bytes::complete::{tag, take_till, take_until};
use nom::character::complete::{char, multispace0};
use nom::multi::many1;
use nom::sequence::delimited;
use nom::IResult;

use crate::error::{Result, ThinBackupError};

//------------------------------------------

/// The resolved identity of one thin logical volume, as parsed from
/// `lvs --nameprefixes` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub uuid: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub thin_id: u64,
    pub pool_path: PathBuf,
    pub vg: String,
    pub lv: String,
}

//------------------------------------------
// lvs --nameprefixes output:
//
//   LVM2_LV_UUID='ABCdef...' LVM2_LV_PATH='/dev/vg/lv' LVM2_LV_FULL_NAME='vg/lv' \
//   LVM2_LV_SIZE='134217728B' LVM2_THIN_ID='3' LVM2_POOL_LV='pool' LVM2_VG_NAME='vg' \
//   LVM2_LV_NAME='lv'
//
// one such line per reported LV. Every value is single-quoted; byte counts
// carry a trailing `B` unit marker.

fn quoted_value(input: &str) -> IResult<&str, &str> {
    delimited(char('\''), take_until("'"), char('\''))(input)
}

fn key(input: &str) -> IResult<&str, &str> {
    take_till(|c| c == '=')(input)
}

fn kv_pair(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, _) = multispace0(input)?;
    let (input, k) = key(input)?;
    let (input, _) = tag("=")(input)?;
    let (input, v) = quoted_value(input)?;
    Ok((input, (k, v)))
}

fn line(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    many1(kv_pair)(input)
}

fn parse_size_bytes(raw: &str, program: &str) -> Result<u64> {
    let digits = raw.strip_suffix('B').unwrap_or(raw);
    digits
        .parse::<u64>()
        .map_err(|e| ThinBackupError::ToolOutputUnparseable {
            program: program.to_string(),
            reason: format!("bad size '{raw}': {e}"),
        })
}

fn parse_u64(raw: &str, field: &str, program: &str) -> Result<u64> {
    raw.parse::<u64>()
        .map_err(|e| ThinBackupError::ToolOutputUnparseable {
            program: program.to_string(),
            reason: format!("bad {field} '{raw}': {e}"),
        })
}

fn lookup<'a>(pairs: &'a [(&str, &str)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| *v)
}

fn parse_one_line(raw_line: &str) -> Result<Option<VolumeInfo>> {
    let trimmed = raw_line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let (_, pairs) =
        line(trimmed).map_err(|e| ThinBackupError::ToolOutputUnparseable {
            program: "lvs".to_string(),
            reason: format!("malformed report line '{trimmed}': {e}"),
        })?;

    let req = |name: &str| -> Result<String> {
        lookup(&pairs, name)
            .map(|v| v.to_string())
            .ok_or_else(|| ThinBackupError::ToolOutputUnparseable {
                program: "lvs".to_string(),
                reason: format!("missing field '{name}' in line '{trimmed}'"),
            })
    };

    let uuid = req("LVM2_LV_UUID")?;
    let path = PathBuf::from(req("LVM2_LV_PATH")?);
    let full_name = req("LVM2_LV_FULL_NAME")?;
    let size_bytes = parse_size_bytes(&req("LVM2_LV_SIZE")?, "lvs")?;
    let thin_id = parse_u64(&req("LVM2_THIN_ID")?, "LVM2_THIN_ID", "lvs")?;
    let pool_lv = req("LVM2_POOL_LV")?;
    let vg = req("LVM2_VG_NAME")?;
    let lv = req("LVM2_LV_NAME")?;

    let pool_path = PathBuf::from(format!("/dev/{vg}/{pool_lv}"));
    let _ = full_name;

    Ok(Some(VolumeInfo {
        uuid,
        path,
        size_bytes,
        thin_id,
        pool_path,
        vg,
        lv,
    }))
}

/// Parses the full `lvs --nameprefixes --noheadings` stdout, one `VolumeInfo`
/// per non-blank line.
pub fn parse_lvs_output(stdout: &[u8]) -> Result<Vec<VolumeInfo>> {
    let text =
        std::str::from_utf8(stdout).map_err(|e| ThinBackupError::ToolOutputUnparseable {
            program: "lvs".to_string(),
            reason: format!("non-utf8 output: {e}"),
        })?;

    text.lines().filter_map(|l| parse_one_line(l).transpose()).collect()
}

//------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_reported_line() {
        let out = b"  LVM2_LV_UUID='abc-123' LVM2_LV_PATH='/dev/vg0/thin1' \
LVM2_LV_FULL_NAME='vg0/thin1' LVM2_LV_SIZE='134217728B' LVM2_THIN_ID='3' \
LVM2_POOL_LV='pool0' LVM2_VG_NAME='vg0' LVM2_LV_NAME='thin1'\n";

        let vols = parse_lvs_output(out).unwrap();
        assert_eq!(vols.len(), 1);
        let v = &vols[0];
        assert_eq!(v.uuid, "abc-123");
        assert_eq!(v.path, PathBuf::from("/dev/vg0/thin1"));
        assert_eq!(v.size_bytes, 134_217_728);
        assert_eq!(v.thin_id, 3);
        assert_eq!(v.pool_path, PathBuf::from("/dev/vg0/pool0"));
        assert_eq!(v.vg, "vg0");
        assert_eq!(v.lv, "thin1");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let out = b"\n  \n";
        assert_eq!(parse_lvs_output(out).unwrap(), vec![]);
    }

    #[test]
    fn missing_field_is_unparseable() {
        let out = b"LVM2_LV_UUID='abc'\n";
        assert!(parse_lvs_output(out).is_err());
    }
}

//------------------------------------------
