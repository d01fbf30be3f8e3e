/// Expand a Slurm hostlist expression into the node names it denotes:
///
///   hostlist ::= host ("," host)*
///   host     ::= (literal | "[" range ("," range)* "]")+
///   range    ::= number ("-" number)?
///
/// so that `holygpu8a[11101-11102],holygpu2c0923` yields three names.  Leading zeroes in the first
/// number of a range set the width of every number in it, `gpu[08-10]` is gpu08, gpu09, gpu10.

use anyhow::{bail, Result};
use std::str::FromStr;

// No expression may expand to more names than this.
const MAX_NAMES: usize = 100_000;

pub fn expand_hostlist(s: &str) -> Result<Vec<String>> {
    let mut parser = Parser::new(s);
    parser.parse_hostlist()?;
    Ok(parser.result)
}

struct Parser {
    result: Vec<String>,        // Expanded host names
    names: Vec<String>,         // Names for the host being parsed
    input: Vec<char>,
    i: usize,
}

impl Parser {
    fn new(s: &str) -> Parser {
        Parser {
            result: vec![],
            names: vec!["".to_string()],
            input: s.trim().chars().collect::<Vec<char>>(),
            i: 0,
        }
    }

    fn parse_hostlist(&mut self) -> Result<()> {
        self.parse_host()?;
        while !self.at_end() {
            self.match_char(',')?;
            self.parse_host()?;
        }
        Ok(())
    }

    // Stops at, but does not consume, the ',' that ends the host.

    fn parse_host(&mut self) -> Result<()> {
        while !self.at_end() {
            match self.peek()? {
                ',' => break,
                '[' => {
                    self.advance();
                    let numbers = self.parse_brackets()?;
                    self.push_numbers(&numbers)?;
                }
                ']' => bail!("Unmatched ']' at position {}", self.i),
                c => {
                    self.advance();
                    self.push_char(c);
                }
            }
        }
        self.finish_host()
    }

    // The '[' has been consumed; this consumes the ']'.

    fn parse_brackets(&mut self) -> Result<Vec<String>> {
        let mut numbers = self.parse_range()?;
        while self.peek()? != ']' {
            self.match_char(',')?;
            numbers.extend(self.parse_range()?);
            if numbers.len() > MAX_NAMES {
                bail!("Hostlist expands to more than {MAX_NAMES} names");
            }
        }
        self.match_char(']')?;
        Ok(numbers)
    }

    fn parse_range(&mut self) -> Result<Vec<String>> {
        let (m, width) = self.parse_number()?;
        if self.peek()? != '-' {
            return Ok(vec![format!("{m:0width$}")]);
        }
        self.advance();
        let (n, _) = self.parse_number()?;
        if n < m {
            bail!("Descending range {m}-{n}");
        }
        if (n - m) as usize >= MAX_NAMES {
            bail!("Range {m}-{n} is too large");
        }
        Ok((m..=n).map(|k| format!("{k:0width$}")).collect())
    }

    // The number and the width to print it at: its digit count if it has a leading zero, else 1.

    fn parse_number(&mut self) -> Result<(u32, usize)> {
        let start = self.i;
        while !self.at_end() && self.input[self.i].is_ascii_digit() {
            self.i += 1;
        }
        if self.i == start {
            bail!("Expected number at position {start}");
        }
        let digits = self.input[start..self.i].iter().collect::<String>();
        let width = if digits.len() > 1 && digits.starts_with('0') { digits.len() } else { 1 };
        Ok((u32::from_str(&digits)?, width))
    }

    fn push_char(&mut self, c: char) {
        for s in &mut self.names {
            s.push(c);
        }
    }

    fn push_numbers(&mut self, numbers: &[String]) -> Result<()> {
        if self.result.len() + self.names.len().saturating_mul(numbers.len()) > MAX_NAMES {
            bail!("Hostlist expands to more than {MAX_NAMES} names");
        }
        self.names = self
            .names
            .iter()
            .flat_map(|s| numbers.iter().map(move |n| format!("{s}{n}")))
            .collect();
        Ok(())
    }

    fn finish_host(&mut self) -> Result<()> {
        if self.names.len() == 1 && self.names[0].is_empty() {
            bail!("Empty host name at position {}", self.i)
        }
        self.result.append(&mut self.names);
        self.names = vec!["".to_string()];
        Ok(())
    }

    fn match_char(&mut self, c: char) -> Result<()> {
        if self.peek()? != c {
            bail!("Expected '{c}' at position {}", self.i);
        }
        self.advance();
        Ok(())
    }

    fn peek(&self) -> Result<char> {
        if self.at_end() {
            bail!("Unexpected end of hostlist")
        }
        Ok(self.input[self.i])
    }

    fn advance(&mut self) {
        if !self.at_end() {
            self.i += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.i == self.input.len()
    }
}

#[cfg(test)]
fn strings(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_expand_hostlist() {
    assert!(expand_hostlist("holygpu8a11101").unwrap() == strings(&["holygpu8a11101"]));
    assert!(
        expand_hostlist("holygpu8a[11101-11103]").unwrap()
            == strings(&["holygpu8a11101", "holygpu8a11102", "holygpu8a11103"])
    );
    assert!(
        expand_hostlist("c1-[0-1],c2-[2-3]").unwrap() == strings(&["c1-0", "c1-1", "c2-2", "c2-3"])
    );
    assert!(
        expand_hostlist("c3-[1-3,5,9-10]").unwrap()
            == strings(&["c3-1", "c3-2", "c3-3", "c3-5", "c3-9", "c3-10"])
    );
    assert!(
        expand_hostlist("r[1-2]n[1,3]").unwrap() == strings(&["r1n1", "r1n3", "r2n1", "r2n3"])
    );
    assert!(expand_hostlist("gpu[08-10]").unwrap() == strings(&["gpu08", "gpu09", "gpu10"]));
    assert!(expand_hostlist(" a,b ").unwrap() == strings(&["a", "b"]));
}

#[test]
fn test_expand_hostlist_errors() {
    assert!(expand_hostlist("").is_err());
    assert!(expand_hostlist("a,,b").is_err());
    assert!(expand_hostlist("a,").is_err());
    assert!(expand_hostlist("c[1-").is_err());
    assert!(expand_hostlist("c[]").is_err());
    assert!(expand_hostlist("c[x]").is_err());
    assert!(expand_hostlist("c[3-1]").is_err());
    assert!(expand_hostlist("c1]").is_err());
}

#[test]
fn test_expand_hostlist_limits() {
    let err = expand_hostlist("c[1-4000000000]").unwrap_err().to_string();
    assert!(err == "Range 1-4000000000 is too large");
    assert!(expand_hostlist("c[1-50000]d[1-50000]").is_err());
    assert!(expand_hostlist("c[1-60000,1-60000]").is_err());
    assert!(expand_hostlist("c[1-60000],d[1-60000]").is_err());
    assert!(expand_hostlist("c[1-100000]").unwrap().len() == 100_000);
}
