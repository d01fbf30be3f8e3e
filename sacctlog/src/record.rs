// Turn accounting lines into job records.
//
// The input is `sacct --parsable2` output: one job per line, fields separated by '|', no quoting.
// The column layout we depend on (zero-based) is
//
//   0 JobID, 1 JobName, 2 User, 3 Group, 4 Partition, 5 Elapsed, 6 AllocTRES, 7 NodeList
//
// and anything after that is ignored.  The state column is not at a fixed position across sites'
// `--format` strings, so the state test looks at the whole line.
//
// Lines are either turned into records or skipped, never an error:
//
// - A line qualifies if it mentions "gpu" somewhere and does not mention RUNNING or PENDING.
//   This also disposes of the header line, which has no "gpu" in it.
//
// - A qualifying line with fewer than MIN_FIELDS fields, or with an empty user, group or
//   partition, is malformed.

use crate::JobRecord;
use anyhow::Result;
use std::io::{self, BufRead, BufReader};
use std::str;

pub const FIELD_DELIMITER: u8 = b'|';
pub const MIN_FIELDS: usize = 8;

const USER: usize = 2;
const GROUP: usize = 3;
const PARTITION: usize = 4;
const ELAPSED: usize = 5;
const TRES: usize = 6;
const NODES: usize = 7;

/// Why a line did not produce a record.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Not a GPU job, or not a finished one.
    NotQualifying,

    /// Too few fields or empty identifiers, or the line could not be decoded.
    Malformed,
}

/// Parse one accounting line.

pub fn parse_line(line: &str) -> Result<JobRecord, Skip> {
    let fields = line.split(FIELD_DELIMITER as char).collect::<Vec<&str>>();
    parse_fields(&fields)
}

fn parse_fields(fields: &[&str]) -> Result<JobRecord, Skip> {
    let has_gpu = fields.iter().any(|f| f.contains("gpu"));
    let unfinished = fields.iter().any(|f| f.contains("RUNNING") || f.contains("PENDING"));
    if !has_gpu || unfinished {
        return Err(Skip::NotQualifying);
    }
    if fields.len() < MIN_FIELDS {
        return Err(Skip::Malformed);
    }

    let user_id = fields[USER].trim();
    let group_id = first_entry(fields[GROUP]);
    let partition_id = first_entry(fields[PARTITION]);
    if user_id.is_empty() || group_id.is_empty() || partition_id.is_empty() {
        return Err(Skip::Malformed);
    }

    Ok(JobRecord {
        user_id: user_id.to_string(),
        group_id: group_id.to_string(),
        partition_id: partition_id.to_string(),
        elapsed_wall: fields[ELAPSED].trim().to_string(),
        resource_spec: fields[TRES].trim().to_string(),
        node_name: fields[NODES].trim().to_string(),
    })
}

fn first_entry(field: &str) -> &str {
    field.split(',').next().unwrap_or("").trim()
}

/// Read accounting records from `input` and hand each record, or the reason it was skipped, to
/// `sink` along with its line number (1-based, counting blank lines).  Returns the number of
/// non-blank lines seen.
///
/// I/O errors are returned, as are errors returned by `sink`.  Lines that can't be decoded (bad
/// UTF-8) are passed on as malformed.  Blank lines are not seen at all.

pub fn read_accounting<R, F>(input: R, mut sink: F) -> Result<usize>
where
    R: io::Read,
    F: FnMut(usize, Result<JobRecord, Skip>) -> Result<()>,
{
    let mut count = 0;
    for (lineno, bytes) in BufReader::new(input).split(b'\n').enumerate() {
        let bytes = bytes?;
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(&bytes);
        if bytes.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        count += 1;
        let parsed = match str::from_utf8(bytes) {
            Ok(line) => parse_line(line),
            Err(_) => Err(Skip::Malformed),
        };
        sink(lineno + 1, parsed)?;
    }
    Ok(count)
}

#[cfg(test)]
const COMPLETED: &str = "1001|train|alice|kempner_lab,other_lab|kempner,gpu|01:00:00|cpu=8,gres/gpu:nvidia_h100_80gb_hbm3=2,gres/gpu=2,mem=64G|holygpu8a11101|COMPLETED";

#[test]
fn test_parse_line() {
    let job = parse_line(COMPLETED).unwrap();
    assert!(job.user_id == "alice");
    assert!(job.group_id == "kempner_lab");
    assert!(job.partition_id == "kempner");
    assert!(job.elapsed_wall == "01:00:00");
    assert!(job.resource_spec == "cpu=8,gres/gpu:nvidia_h100_80gb_hbm3=2,gres/gpu=2,mem=64G");
    assert!(job.node_name == "holygpu8a11101");
}

#[test]
fn test_parse_line_skips() {
    assert!(parse_line(&COMPLETED.replace("COMPLETED", "RUNNING")) == Err(Skip::NotQualifying));
    assert!(parse_line(&COMPLETED.replace("COMPLETED", "PENDING")) == Err(Skip::NotQualifying));
    assert!(parse_line("1007|cpu|erin|lab|shared|01:00:00|cpu=4|holy7c0101|COMPLETED") == Err(Skip::NotQualifying));
    assert!(parse_line("JobID|JobName|User|Group|Partition|Elapsed|AllocTRES|NodeList|State") == Err(Skip::NotQualifying));
    assert!(parse_line("") == Err(Skip::NotQualifying));

    assert!(parse_line("1010|broken|gpu") == Err(Skip::Malformed));
    assert!(parse_line("1|x||lab|gpu|01:00:00|gres/gpu=1|n1|COMPLETED") == Err(Skip::Malformed));
    assert!(parse_line("1|x|bob|,lab|gpu|01:00:00|gres/gpu=1|n1|COMPLETED") == Err(Skip::Malformed));

    // Exactly MIN_FIELDS is enough
    assert!(parse_line("1|x|bob|lab|gpu|01:00:00|gres/gpu=1|n1").is_ok());
}

#[test]
fn test_read_accounting() {
    let input = format!("JobID|JobName|User\n{COMPLETED}\n\n1010|broken|gpu\n");
    let mut seen = vec![];
    let n = read_accounting(input.as_bytes(), |line, r| {
        seen.push((line, r.map(|job| job.user_id)));
        Ok(())
    })
    .unwrap();
    assert!(n == 3);
    assert!(seen[0] == (1, Err(Skip::NotQualifying)));
    assert!(seen[1] == (2, Ok("alice".to_string())));
    assert!(seen[2] == (4, Err(Skip::Malformed)));
}

#[test]
fn test_read_accounting_bad_utf8() {
    let mut input = COMPLETED.as_bytes().to_vec();
    input.extend_from_slice(b"\n1|x|b\xffb|lab|gpu|01:00:00|gres/gpu=1|n1|COMPLETED\n");
    let mut skips = 0;
    let mut jobs = 0;
    read_accounting(&input[..], |_, r| {
        match r {
            Ok(_) => jobs += 1,
            Err(Skip::Malformed) => skips += 1,
            Err(Skip::NotQualifying) => panic!("unexpected skip"),
        }
        Ok(())
    })
    .unwrap();
    assert!(jobs == 1);
    assert!(skips == 1);
}

#[test]
fn test_read_accounting_counts_blank_lines() {
    let input = format!("JobID|JobName|User\n{COMPLETED}\n\n1010|broken|gpu\n\n\n{COMPLETED}\n");
    let mut seen = vec![];
    let n = read_accounting(input.as_bytes(), |line, r| {
        seen.push((line, r.is_ok()));
        Ok(())
    })
    .unwrap();
    assert!(n == 4);
    assert!(seen == vec![(1, false), (2, true), (4, false), (7, true)]);

    // CRLF line ends are tolerated
    let input = format!("{COMPLETED}\r\n\r\n{COMPLETED}\r\n");
    let mut lines = vec![];
    read_accounting(input.as_bytes(), |line, r| {
        assert!(r.unwrap().node_name == "holygpu8a11101");
        lines.push(line);
        Ok(())
    })
    .unwrap();
    assert!(lines == vec![1, 3]);
}
