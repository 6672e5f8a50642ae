//! JA3, as explained in <https://github.com/salesforce/ja3>: a comma-separated
//! record of TLS version, cipher suites, extensions, curves, and EC point
//! formats, with dash-separated ids inside each list.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3 {
    /// SSLVersion, informational only
    pub version: u16,
    /// Cipher
    pub ciphers: Vec<u16>,
    /// SSLExtension
    pub extensions: Vec<u16>,
    /// EllipticCurve
    pub curves: Vec<u16>,
    /// EllipticCurvePointFormat
    pub point_formats: Vec<u8>,
}

fn parse_list<T: FromStr>(field: &str, what: &str) -> Result<Vec<T>, Error> {
    field
        .split('-')
        .map(|tok| {
            tok.parse::<T>()
                .map_err(|_| Error::Ja3Field(format!("{} id not an integer: {:?}", what, tok)))
        })
        .collect()
}

// Curves and point formats may legitimately be absent; a single empty token
// means an empty list, not a list of one empty id.
fn parse_optional_list<T: FromStr>(field: &str, what: &str) -> Result<Vec<T>, Error> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    parse_list(field, what)
}

impl FromStr for Ja3 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Ja3, Error> {
        let tokens: Vec<&str> = s.split(',').collect();
        if tokens.len() < 5 {
            return Err(Error::Ja3Malformed(tokens.len()));
        }
        Ok(Ja3 {
            version: tokens[0]
                .parse::<u16>()
                .map_err(|_| Error::Ja3Field(format!("version not an integer: {:?}", tokens[0])))?,
            ciphers: parse_list(tokens[1], "cipher")?,
            extensions: parse_list(tokens[2], "extension")?,
            curves: parse_optional_list(tokens[3], "curve")?,
            point_formats: parse_optional_list(tokens[4], "point format")?,
        })
    }
}

impl fmt::Display for Ja3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(ids: &[T]) -> String {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join("-")
        }
        write!(
            f,
            "{},{},{},{},{}",
            self.version,
            join(&self.ciphers),
            join(&self.extensions),
            join(&self.curves),
            join(&self.point_formats)
        )
    }
}
