// Parse the Elapsed column of sacct output into fractional hours.
//
// The syntax is `[D-]HH:MM:SS`: an optional day count followed by '-', then exactly three
// colon-separated integers.  There is no range checking, `00:75:00` is 1.25 hours.  sacct does not
// produce that but we don't reject it either.
//
// A field that does not parse is an error and not a skipped record.  It means the upstream format
// changed, and totals computed from a partially understood file would be wrong.

use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ElapsedError {
    #[error("elapsed time `{0}`: expected [D-]HH:MM:SS")]
    Syntax(String),

    #[error("elapsed time `{text}`: bad number `{component}`")]
    Number {
        text: String,
        component: String,
        #[source]
        source: ParseIntError,
    },
}

/// Convert `[D-]HH:MM:SS` to hours.

pub fn elapsed_hours(text: &str) -> Result<f64, ElapsedError> {
    let text = text.trim();
    let (days, clock) = match text.split_once('-') {
        Some((days, clock)) => (component(text, days)?, clock),
        None => (0, text),
    };
    let parts = clock.split(':').collect::<Vec<&str>>();
    if parts.len() != 3 {
        return Err(ElapsedError::Syntax(text.to_string()));
    }
    let hours = component(text, parts[0])?;
    let minutes = component(text, parts[1])?;
    let seconds = component(text, parts[2])?;

    Ok(days as f64 * 24.0 + hours as f64 + minutes as f64 / 60.0 + seconds as f64 / 3600.0)
}

fn component(text: &str, s: &str) -> Result<u64, ElapsedError> {
    u64::from_str(s).map_err(|source| ElapsedError::Number {
        text: text.to_string(),
        component: s.to_string(),
        source,
    })
}

#[cfg(test)]
fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn test_elapsed_hours() {
    assert!(close(elapsed_hours("1-02:03:04").unwrap(), 24.0 + 2.0 + 3.0 / 60.0 + 4.0 / 3600.0));
    assert!(close(elapsed_hours("02:03:04").unwrap(), 2.0 + 3.0 / 60.0 + 4.0 / 3600.0));
    assert!(close(elapsed_hours("00:10:00").unwrap(), 1.0 / 6.0));
    assert!(close(elapsed_hours("00:00:00").unwrap(), 0.0));
    assert!(close(elapsed_hours("13-00:00:00").unwrap(), 13.0 * 24.0));

    // Not range checked
    assert!(close(elapsed_hours("00:75:00").unwrap(), 1.25));
}

#[test]
fn test_elapsed_hours_errors() {
    assert!(elapsed_hours("") == Err(ElapsedError::Syntax("".to_string())));
    assert!(elapsed_hours("02:03") == Err(ElapsedError::Syntax("02:03".to_string())));
    assert!(elapsed_hours("1-") == Err(ElapsedError::Syntax("1-".to_string())));
    assert!(elapsed_hours("01:02:03:04").is_err());

    match elapsed_hours("1-2-03:00:00") {
        Err(ElapsedError::Number { component, .. }) => assert!(component == "2-03"),
        x => panic!("unexpected {:?}", x),
    }
    match elapsed_hours("aa:00:00") {
        Err(ElapsedError::Number { text, component, .. }) => {
            assert!(text == "aa:00:00");
            assert!(component == "aa");
        }
        x => panic!("unexpected {:?}", x),
    }
}
