//! Credentials and numeric tribunal ordering.
//!
//! Tribunal codes carry a region number: "TRT1", "TRT2", ..., "TRT24".
//! Batches visit portals in ascending region order, so codes compare by that
//! number and never lexically (as strings "TRT10" < "TRT2").
//!
//! # Accepted spellings
//!
//! - Canonical: `TRT2`, `TRT10`
//! - Zero-padded: `TRT02` (normalised to `TRT2`)
//! - Any case and surrounding whitespace: ` trt2 `

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// A court region code such as `TRT2`, stored as prefix + region number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TribunalCode {
    prefix: String,
    number: u32,
}

impl TribunalCode {
    /// Region number embedded in the code (`TRT10` → 10).
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl FromStr for TribunalCode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let digit_start = upper
            .bytes()
            .position(|b| b.is_ascii_digit())
            .ok_or_else(|| ParseError::new("tribunal code", s))?;
        let (prefix, digits) = upper.split_at(digit_start);
        if prefix.is_empty()
            || !prefix.bytes().all(|b| b.is_ascii_uppercase())
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(ParseError::new("tribunal code", s));
        }
        let number = digits
            .parse()
            .map_err(|_| ParseError::new("tribunal code", s))?;
        Ok(Self {
            prefix: prefix.to_string(),
            number,
        })
    }
}

impl TryFrom<String> for TribunalCode {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TribunalCode> for String {
    fn from(code: TribunalCode) -> Self {
        code.to_string()
    }
}

impl fmt::Display for TribunalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.number)
    }
}

impl Ord for TribunalCode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number
            .cmp(&other.number)
            .then_with(|| self.prefix.cmp(&other.prefix))
    }
}

impl PartialOrd for TribunalCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Procedural tier of a portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLevel {
    PrimeiroGrau,
    SegundoGrau,
    TribunalSuperior,
}

impl InstanceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimeiroGrau => "primeiro_grau",
            Self::SegundoGrau => "segundo_grau",
            Self::TribunalSuperior => "tribunal_superior",
        }
    }
}

impl FromStr for InstanceLevel {
    type Err = ParseError;

    /// Accepts the snake_case names and the credential shorthand `"1"`/`"2"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "primeiro_grau" | "1" => Ok(Self::PrimeiroGrau),
            "segundo_grau" | "2" => Ok(Self::SegundoGrau),
            "tribunal_superior" | "3" => Ok(Self::TribunalSuperior),
            other => Err(ParseError::new("instance level", other)),
        }
    }
}

impl fmt::Display for InstanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored secret reference enabling login to one tribunal/instance pair.
///
/// Owned by exactly one advogado. Rows are never edited: rotation issues a
/// new credential id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub advogado_id: i64,
    pub tribunal: TribunalCode,
    pub instance: InstanceLevel,
    /// Opaque pointer into the secret backend (never the secret itself).
    pub secret_ref: String,
}

/// Region number embedded in a raw tribunal code string, if it parses.
pub fn tribunal_number(code: &str) -> Option<u32> {
    code.parse::<TribunalCode>().ok().map(|c| c.number())
}

/// Sort credentials ascending by tribunal region number.
///
/// Ties break on instance level, then credential id, so the order is total
/// and independent of input order.
pub fn order_by_tribunal(mut credentials: Vec<Credential>) -> Vec<Credential> {
    credentials.sort_by(|a, b| {
        a.tribunal
            .cmp(&b.tribunal)
            .then_with(|| a.instance.cmp(&b.instance))
            .then_with(|| a.id.cmp(&b.id))
    });
    credentials
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(id: i64, tribunal: &str, instance: InstanceLevel) -> Credential {
        Credential {
            id,
            advogado_id: 1,
            tribunal: tribunal.parse().unwrap(),
            instance,
            secret_ref: format!("env:SECRET_{id}"),
        }
    }

    fn codes(credentials: &[Credential]) -> Vec<String> {
        credentials.iter().map(|c| c.tribunal.to_string()).collect()
    }

    #[test]
    fn numeric_not_lexical_order() {
        let input = vec![
            cred(1, "TRT24", InstanceLevel::PrimeiroGrau),
            cred(2, "TRT10", InstanceLevel::PrimeiroGrau),
            cred(3, "TRT2", InstanceLevel::PrimeiroGrau),
        ];
        let ordered = order_by_tribunal(input);
        assert_eq!(codes(&ordered), vec!["TRT2", "TRT10", "TRT24"]);
    }

    #[test]
    fn order_independent_of_input_permutation() {
        let base = ["TRT3", "TRT1", "TRT15", "TRT9", "TRT2", "TRT10"];
        let expected = vec!["TRT1", "TRT2", "TRT3", "TRT9", "TRT10", "TRT15"];
        for rotation in 0..base.len() {
            let mut rotated = base.to_vec();
            rotated.rotate_left(rotation);
            let input: Vec<Credential> = rotated
                .iter()
                .enumerate()
                .map(|(i, code)| cred(i as i64, code, InstanceLevel::PrimeiroGrau))
                .collect();
            assert_eq!(codes(&order_by_tribunal(input)), expected);
        }
    }

    #[test]
    fn zero_padding_ignored() {
        let input = vec![
            cred(1, "TRT10", InstanceLevel::PrimeiroGrau),
            cred(2, "TRT02", InstanceLevel::PrimeiroGrau),
            cred(3, "trt024", InstanceLevel::PrimeiroGrau),
        ];
        let ordered = order_by_tribunal(input);
        assert_eq!(codes(&ordered), vec!["TRT2", "TRT10", "TRT24"]);
    }

    #[test]
    fn ties_break_on_instance_then_id() {
        let input = vec![
            cred(9, "TRT2", InstanceLevel::SegundoGrau),
            cred(7, "TRT2", InstanceLevel::PrimeiroGrau),
            cred(5, "TRT2", InstanceLevel::PrimeiroGrau),
        ];
        let ids: Vec<i64> = order_by_tribunal(input).iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![5, 7, 9]);
    }

    #[test]
    fn parse_normalises() {
        let code: TribunalCode = "  trt02 ".parse().unwrap();
        assert_eq!(code.to_string(), "TRT2");
        assert_eq!(code.number(), 2);
        assert_eq!(code.prefix(), "TRT");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("TRT".parse::<TribunalCode>().is_err());
        assert!("12".parse::<TribunalCode>().is_err());
        assert!("TRT2A".parse::<TribunalCode>().is_err());
        assert!("".parse::<TribunalCode>().is_err());
    }

    #[test]
    fn tribunal_number_helper() {
        assert_eq!(tribunal_number("TRT10"), Some(10));
        assert_eq!(tribunal_number("nope"), None);
    }

    #[test]
    fn instance_level_shorthand() {
        assert_eq!("1".parse::<InstanceLevel>().unwrap(), InstanceLevel::PrimeiroGrau);
        assert_eq!(
            "segundo_grau".parse::<InstanceLevel>().unwrap(),
            InstanceLevel::SegundoGrau
        );
        assert!("quarto".parse::<InstanceLevel>().is_err());
    }

    #[test]
    fn tribunal_code_serde_as_string() {
        let code: TribunalCode = "TRT15".parse().unwrap();
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"TRT15\"");
        let back: TribunalCode = serde_json::from_str("\"trt015\"").unwrap();
        assert_eq!(back, code);
    }
}
