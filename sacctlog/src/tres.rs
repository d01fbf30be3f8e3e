// Tokenizer for Slurm TRES ("trackable resources") lists, as found in the AllocTRES column:
//
//   billing=16,cpu=16,gres/gpu:nvidia_a100-sxm4-80gb=4,gres/gpu=4,mem=500G,node=1
//
// Grammar:
//
//   spec   ::= "" | token ("," token)*
//   token  ::= key (":" subkey)? "=" value
//   key    ::= <any characters but ':' '=' ','>+
//   subkey ::= <any characters but '=' ','>*
//   value  ::= <any characters but ','>*
//
// Keys may contain '/', as in `gres/gpu`.  For `gres/gpu` the subkey is the GPU type, and the
// token without a subkey carries the total number of cards.

use std::str::FromStr;
use thiserror::Error;

pub const GPU_KEY: &str = "gres/gpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TresToken<'a> {
    pub key: &'a str,
    pub subkey: Option<&'a str>,
    pub value: &'a str,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TresError {
    #[error("empty TRES token at position {0}")]
    EmptyToken(usize),

    #[error("TRES token `{0}` has no value")]
    MissingValue(String),

    #[error("TRES token `{0}` has an empty key")]
    EmptyKey(String),
}

/// Tokenize a TRES list, failing on the first malformed token.

pub fn parse_tres(spec: &str) -> Result<Vec<TresToken<'_>>, TresError> {
    if spec.is_empty() {
        return Ok(vec![]);
    }
    spec.split(',')
        .enumerate()
        .map(|(position, token)| parse_token(position, token))
        .collect()
}

/// Tokenize a TRES list, dropping malformed tokens.  This is what the record pipeline uses: the
/// only tokens we care about are the GPU ones, and a stray bad token elsewhere should not hide
/// them.

pub fn parse_tres_lenient(spec: &str) -> Vec<TresToken<'_>> {
    spec.split(',')
        .enumerate()
        .filter_map(|(position, token)| parse_token(position, token).ok())
        .collect()
}

fn parse_token(position: usize, token: &str) -> Result<TresToken<'_>, TresError> {
    if token.is_empty() {
        return Err(TresError::EmptyToken(position));
    }
    let (name, value) = token
        .split_once('=')
        .ok_or_else(|| TresError::MissingValue(token.to_string()))?;
    let (key, subkey) = match name.split_once(':') {
        Some((key, subkey)) => (key, Some(subkey)),
        None => (name, None),
    };
    if key.is_empty() {
        return Err(TresError::EmptyKey(token.to_string()));
    }
    Ok(TresToken { key, subkey, value })
}

/// The number of GPU cards: the value of the first `gres/gpu=N` token, 0 if there is no such token
/// or N is not an unsigned integer.

pub fn gpu_count(tokens: &[TresToken]) -> u32 {
    tokens
        .iter()
        .filter(|t| t.key == GPU_KEY && t.subkey.is_none())
        .find_map(|t| u32::from_str(t.value).ok())
        .unwrap_or(0)
}

/// The GPU types named by `gres/gpu:<type>=...` tokens, in order of appearance.

pub fn gpu_classes<'a>(tokens: &[TresToken<'a>]) -> Vec<&'a str> {
    tokens
        .iter()
        .filter(|t| t.key == GPU_KEY)
        .filter_map(|t| t.subkey)
        .collect()
}

#[test]
fn test_parse_tres() {
    let tokens = parse_tres("billing=16,cpu=16,gres/gpu:nvidia_a100=4,gres/gpu=4,mem=500G").unwrap();
    assert!(tokens.len() == 5);
    assert!(tokens[0] == TresToken { key: "billing", subkey: None, value: "16" });
    assert!(tokens[2] == TresToken { key: "gres/gpu", subkey: Some("nvidia_a100"), value: "4" });
    assert!(tokens[3] == TresToken { key: "gres/gpu", subkey: None, value: "4" });
    assert!(tokens[4].value == "500G");

    assert!(parse_tres("").unwrap().is_empty());
    assert!(parse_tres("mem=").unwrap()[0].value == "");
}

#[test]
fn test_parse_tres_errors() {
    assert!(parse_tres("cpu=4,,mem=1G") == Err(TresError::EmptyToken(1)));
    assert!(parse_tres("cpu=4,gres/gpu") == Err(TresError::MissingValue("gres/gpu".to_string())));
    assert!(parse_tres(":h100=2") == Err(TresError::EmptyKey(":h100=2".to_string())));

    // Lenient mode keeps the good tokens
    let tokens = parse_tres_lenient("cpu=4,,junk,gres/gpu=2");
    assert!(tokens.len() == 2);
    assert!(gpu_count(&tokens) == 2);
}

#[test]
fn test_gpu_fields() {
    let spec = "cpu=8,gres/gpu:nvidia_h100_80gb_hbm3=2,gres/gpu=2,mem=64G,node=1";
    let tokens = parse_tres_lenient(spec);
    assert!(gpu_count(&tokens) == 2);
    assert!(gpu_classes(&tokens) == vec!["nvidia_h100_80gb_hbm3"]);

    // No count at all, or only a typed count
    assert!(gpu_count(&parse_tres_lenient("cpu=8,mem=64G")) == 0);
    assert!(gpu_count(&parse_tres_lenient("gres/gpu:a100=2")) == 0);
    assert!(gpu_count(&parse_tres_lenient("gres/gpu=many")) == 0);

    // First count wins
    assert!(gpu_count(&parse_tres_lenient("gres/gpu=3,gres/gpu=5")) == 3);

    let tokens = parse_tres_lenient("gres/gpu:a100=1,gres/gpu:h100=1,gres/gpu=2");
    assert!(gpu_classes(&tokens) == vec!["a100", "h100"]);
}
