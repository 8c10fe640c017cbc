//! Callsign → country/zone resolution from a `cty.dat` country file.
//!
//! The file is a sequence of country blocks. Each block is a data line of
//! eight colon-separated fields ending in `:`, then one or more lines of
//! comma-separated alias prefixes ending in `;`:
//!
//! ```text
//! Austria:                  15:  28:  EU:   47.33:   -13.33:    -1.0:  OE:
//!     OE,=OE50XYZ(14)[27];
//! ```
//!
//! An alias starting with `=` matches a full callsign exactly; anything else
//! is a prefix. `(n)` overrides the CQ zone and `[n]` the ITU zone. The
//! `<lat/lon>`, `{cc}` and `~tz~` overrides are accepted but not applied.
//!
//! Data files: <https://www.country-files.com>

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_until, take_while1},
    character::complete::{alpha1, char, digit1},
    combinator::{all_consuming, map_res, opt, value},
    multi::many0,
    sequence::delimited,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading a country file.
#[derive(Debug, Error)]
pub enum CtyError {
    #[error("failed to read country file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected a country data line ending in ':'")]
    ExpectedCountry { line: usize },

    #[error("line {line}: country data line has {found} fields, expected 8")]
    FieldCount { line: usize, found: usize },

    #[error("line {line}: invalid {field} '{value}'")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: country data line inside the alias list of {country}")]
    UnexpectedCountry { line: usize, country: String },

    #[error("line {line}: malformed alias '{alias}'")]
    BadAlias { line: usize, alias: String },

    #[error("alias list of {country} is not terminated with ';'")]
    UnterminatedAliases { country: String },

    #[error("country file contains no countries")]
    Empty,
}

/// A country (DXCC entity) as defined by its data line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Country {
    pub name: String,
    pub cq_zone: u8,
    pub itu_zone: u8,
    /// Two-letter continent code.
    pub continent: String,
    /// Degrees, positive North.
    pub latitude: f64,
    /// Degrees, positive West.
    pub longitude: f64,
    /// Local time offset from UTC in hours.
    pub utc_offset: f64,
    pub primary_prefix: String,
}

/// What a callsign resolves to: its country plus any zone overrides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryInfo {
    pub country: String,
    pub cq_zone: u8,
    pub itu_zone: u8,
    pub continent: String,
    pub latitude: f64,
    pub longitude: f64,
    pub utc_offset: f64,
}

impl CountryInfo {
    fn from_country(country: &Country) -> Self {
        Self {
            country: country.name.clone(),
            cq_zone: country.cq_zone,
            itu_zone: country.itu_zone,
            continent: country.continent.clone(),
            latitude: country.latitude,
            longitude: country.longitude,
            utc_offset: country.utc_offset,
        }
    }
}

/// Immutable lookup table built once from a country file.
#[derive(Debug, Default)]
pub struct CountryTable {
    countries: Vec<Country>,
    exact: HashMap<String, CountryInfo>,
    prefixes: HashMap<String, CountryInfo>,
    longest_prefix: usize,
}

impl CountryTable {
    /// Load and parse a country file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CtyError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| CtyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::parse(&text)?;
        debug!(
            "Loaded {} countries, {} prefixes, {} exact calls from {}",
            table.countries.len(),
            table.prefixes.len(),
            table.exact.len(),
            path.display()
        );
        Ok(table)
    }

    /// Parse country file text.
    ///
    /// When the same exact callsign or prefix appears twice, the first
    /// definition wins.
    pub fn parse(text: &str) -> Result<Self, CtyError> {
        let mut table = Self::default();
        let mut aliases = String::new();
        let mut open_country: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let Some(country_idx) = open_country else {
                let data = line
                    .strip_suffix(':')
                    .ok_or(CtyError::ExpectedCountry { line: line_no })?;
                table.countries.push(parse_country_line(data, line_no)?);
                open_country = Some(table.countries.len() - 1);
                continue;
            };

            if line.ends_with(':') {
                return Err(CtyError::UnexpectedCountry {
                    line: line_no,
                    country: table.countries[country_idx].name.clone(),
                });
            }

            match line.strip_suffix(';') {
                Some(last) => {
                    aliases.push_str(last);
                    table.add_aliases(country_idx, &aliases, line_no)?;
                    aliases.clear();
                    open_country = None;
                }
                None => {
                    aliases.push_str(line);
                    // The trailing comma on continued lines is optional.
                    if !line.ends_with(',') {
                        aliases.push(',');
                    }
                }
            }
        }

        if let Some(country_idx) = open_country {
            return Err(CtyError::UnterminatedAliases {
                country: table.countries[country_idx].name.clone(),
            });
        }
        if table.countries.is_empty() {
            return Err(CtyError::Empty);
        }
        Ok(table)
    }

    fn add_aliases(&mut self, country_idx: usize, list: &str, line: usize) -> Result<(), CtyError> {
        let country = &self.countries[country_idx];

        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (_, alias) = all_consuming(alias_token)
                .parse(token)
                .map_err(|_| CtyError::BadAlias {
                    line,
                    alias: token.to_string(),
                })?;

            let mut info = CountryInfo::from_country(country);
            if let Some(cq) = alias.cq_zone {
                info.cq_zone = cq;
            }
            if let Some(itu) = alias.itu_zone {
                info.itu_zone = itu;
            }

            if alias.exact {
                self.exact.entry(alias.call.to_string()).or_insert(info);
            } else {
                self.longest_prefix = self.longest_prefix.max(alias.call.len());
                self.prefixes.entry(alias.call.to_string()).or_insert(info);
            }
        }
        Ok(())
    }

    /// Resolve a callsign.
    ///
    /// An exact-callsign entry wins over any prefix; otherwise the longest
    /// matching prefix is used.
    pub fn resolve(&self, callsign: &str) -> Option<&CountryInfo> {
        if let Some(info) = self.exact.get(callsign) {
            return Some(info);
        }
        let longest = self.longest_prefix.min(callsign.len());
        (1..=longest).rev().find_map(|len| {
            callsign
                .get(..len)
                .and_then(|prefix| self.prefixes.get(prefix))
        })
    }

    /// Look up a country by name.
    pub fn country(&self, name: &str) -> Option<&Country> {
        self.countries.iter().find(|c| c.name == name)
    }

    pub fn countries(&self) -> &[Country] {
        &self.countries
    }

    /// Number of prefix entries.
    pub fn prefix_count(&self) -> usize {
        self.prefixes.len()
    }

    /// Number of exact-callsign entries.
    pub fn exact_count(&self) -> usize {
        self.exact.len()
    }
}

fn parse_country_line(data: &str, line: usize) -> Result<Country, CtyError> {
    let fields: Vec<&str> = data.split(':').map(str::trim).collect();
    let [name, cq, itu, continent, lat, lon, offset, prefix] = fields[..] else {
        return Err(CtyError::FieldCount {
            line,
            found: fields.len(),
        });
    };

    fn num<T: std::str::FromStr>(
        value: &str,
        field: &'static str,
        line: usize,
    ) -> Result<T, CtyError> {
        value.parse().map_err(|_| CtyError::InvalidField {
            line,
            field,
            value: value.to_string(),
        })
    }

    Ok(Country {
        name: name.to_string(),
        cq_zone: num(cq, "CQ zone", line)?,
        itu_zone: num(itu, "ITU zone", line)?,
        continent: continent.to_string(),
        latitude: num(lat, "latitude", line)?,
        longitude: num(lon, "longitude", line)?,
        utc_offset: num(offset, "UTC offset", line)?,
        primary_prefix: prefix.to_string(),
    })
}

/// One parsed alias entry such as `=KH6ZZ(31)[61]`.
#[derive(Debug, PartialEq)]
struct Alias<'a> {
    exact: bool,
    call: &'a str,
    cq_zone: Option<u8>,
    itu_zone: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Override {
    Cq(u8),
    Itu(u8),
    Ignored,
}

fn is_alias_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '/'
}

fn zone_override(input: &str) -> IResult<&str, Override> {
    alt((
        map_res(delimited(char('('), digit1, char(')')), |d: &str| {
            d.parse().map(Override::Cq)
        }),
        map_res(delimited(char('['), digit1, char(']')), |d: &str| {
            d.parse().map(Override::Itu)
        }),
        value(
            Override::Ignored,
            delimited(char('<'), take_until(">"), char('>')),
        ),
        value(Override::Ignored, delimited(char('{'), alpha1, char('}'))),
        value(
            Override::Ignored,
            delimited(char('~'), take_until("~"), char('~')),
        ),
    ))
    .parse(input)
}

fn alias_token(input: &str) -> IResult<&str, Alias<'_>> {
    let (input, exact) = opt(char('=')).parse(input)?;
    let (input, call) = take_while1(is_alias_char).parse(input)?;
    let (input, overrides) = many0(zone_override).parse(input)?;

    let mut alias = Alias {
        exact: exact.is_some(),
        call,
        cq_zone: None,
        itu_zone: None,
    };
    for o in overrides {
        match o {
            Override::Cq(zone) => alias.cq_zone = Some(zone),
            Override::Itu(zone) => alias.itu_zone = Some(zone),
            Override::Ignored => {}
        }
    }
    Ok((input, alias))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small country file in the real format.
    pub(crate) const SAMPLE_CTY: &str = "\
Austria:                  15:  28:  EU:   47.33:   -13.33:    -1.0:  OE:
    OE,=OE3RSU(16)[29];
United States:            05:  08:  NA:   37.53:    91.67:     5.0:  K:
    AA,AB,AC,AD,AE,AF,AG,AI,AJ,AK,K,N,W,
    =W6JSV(3)[6];
Hawaii:                   31:  61:  OC:   21.12:   157.48:    10.0:  KH6:
    AH6,KH6,NH6,WH6;
Kure Island:              31:  61:  OC:   28.40:   178.37:    10.0:  KH7K:
    KH6Z,KH7K;
Canada:                   05:  09:  NA:   44.35:    78.75:     5.0:  VE:
    CF,CG,VA,VE,VA3<44.0/79.0>{NA}~5.0~,
    VE7(3)[2];
China:                    24:  44:  AS:   36.00:  -102.00:    -8.0:  BY:
    BA,BD,BG,BH,BY,
    =BD4ABC(23)[42];
Bogus Duplicate:          01:  01:  AF:    0.00:     0.00:     0.0:  OE:
    OE,=OE3RSU;
";

    fn table() -> CountryTable {
        CountryTable::parse(SAMPLE_CTY).expect("sample should parse")
    }

    #[test]
    fn test_parse_sample() {
        let table = table();
        assert_eq!(table.countries().len(), 7);
        assert_eq!(table.exact_count(), 3);

        let austria = table.country("Austria").unwrap();
        assert_eq!(austria.cq_zone, 15);
        assert_eq!(austria.itu_zone, 28);
        assert_eq!(austria.continent, "EU");
        assert!((austria.longitude - -13.33).abs() < 1e-9);
        assert_eq!(austria.primary_prefix, "OE");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table();
        let info = table.resolve("KH6ZZZ").unwrap();
        assert_eq!(info.country, "Kure Island");

        assert_eq!(table.resolve("KH6ABC").unwrap().country, "Hawaii");
        assert_eq!(table.resolve("K1ABC").unwrap().country, "United States");
    }

    #[test]
    fn test_exact_match_precedence() {
        let table = table();
        let info = table.resolve("OE3RSU").unwrap();
        assert_eq!(info.country, "Austria");
        assert_eq!(info.cq_zone, 16);
        assert_eq!(info.itu_zone, 29);

        // Other Austrian calls get the country defaults.
        let other = table.resolve("OE3ABC").unwrap();
        assert_eq!(other.cq_zone, 15);
        assert_eq!(other.itu_zone, 28);
    }

    #[test]
    fn test_exact_entry_does_not_match_as_prefix() {
        let table = table();
        // "W6JSV" is exact-only; a longer call falls back to the W prefix.
        assert_eq!(table.resolve("W6JSVX").unwrap().cq_zone, 5);
        assert_eq!(table.resolve("W6JSV").unwrap().cq_zone, 3);
    }

    #[test]
    fn test_zone_overrides_on_prefix() {
        let table = table();
        let info = table.resolve("VE7XYZ").unwrap();
        assert_eq!(info.country, "Canada");
        assert_eq!(info.cq_zone, 3);
        assert_eq!(info.itu_zone, 2);
        assert!((info.latitude - 44.35).abs() < 1e-9);
    }

    #[test]
    fn test_unapplied_overrides_are_accepted() {
        let table = table();
        let info = table.resolve("VA3AAA").unwrap();
        assert_eq!(info.country, "Canada");
        // Latitude override is parsed but not applied.
        assert!((info.latitude - 44.35).abs() < 1e-9);
    }

    #[test]
    fn test_first_definition_wins() {
        let table = table();
        assert_eq!(table.resolve("OE1XYZ").unwrap().country, "Austria");
        assert_eq!(table.resolve("OE3RSU").unwrap().country, "Austria");
    }

    #[test]
    fn test_unknown_callsign() {
        let table = table();
        assert!(table.resolve("XX9XX").is_none());
        assert!(table.resolve("").is_none());
        assert!(table.resolve("ÖE1").is_none());
    }

    #[test]
    fn test_field_count_error() {
        let err = CountryTable::parse("Austria: 15: 28: EU: 47.33:\n    OE;\n").unwrap_err();
        assert!(matches!(err, CtyError::FieldCount { line: 1, found: 5 }));
    }

    #[test]
    fn test_invalid_number_error() {
        let text = "Austria: 15: xx: EU: 47.33: -13.33: -1.0: OE:\n    OE;\n";
        let err = CountryTable::parse(text).unwrap_err();
        assert!(matches!(
            err,
            CtyError::InvalidField {
                line: 1,
                field: "ITU zone",
                ..
            }
        ));
    }

    #[test]
    fn test_unterminated_alias_list() {
        let text = "Austria: 15: 28: EU: 47.33: -13.33: -1.0: OE:\n    OE,\n";
        let err = CountryTable::parse(text).unwrap_err();
        assert!(matches!(err, CtyError::UnterminatedAliases { .. }));
    }

    #[test]
    fn test_country_inside_alias_list() {
        let text = "Austria: 15: 28: EU: 47.33: -13.33: -1.0: OE:\n    OE,\n\
                    Hawaii: 31: 61: OC: 21.12: 157.48: 10.0: KH6:\n    KH6;\n";
        let err = CountryTable::parse(text).unwrap_err();
        assert!(matches!(err, CtyError::UnexpectedCountry { line: 3, .. }));
    }

    #[test]
    fn test_bad_alias() {
        let text = "Austria: 15: 28: EU: 47.33: -13.33: -1.0: OE:\n    OE(x);\n";
        let err = CountryTable::parse(text).unwrap_err();
        assert!(matches!(err, CtyError::BadAlias { line: 2, .. }));
    }

    #[test]
    fn test_empty_file() {
        assert!(matches!(CountryTable::parse("\n\n"), Err(CtyError::Empty)));
    }

    #[test]
    fn test_missing_file() {
        let err = CountryTable::load("/nonexistent/cty.dat").unwrap_err();
        assert!(matches!(err, CtyError::Io { .. }));
    }

    #[test]
    fn test_alias_token() {
        let (_, alias) = alias_token("=KH6ZZ(31)[61]").unwrap();
        assert_eq!(
            alias,
            Alias {
                exact: true,
                call: "KH6ZZ",
                cq_zone: Some(31),
                itu_zone: Some(61),
            }
        );

        let (_, reversed) = alias_token("VE7[2](3)").unwrap();
        assert_eq!(reversed.cq_zone, Some(3));
        assert_eq!(reversed.itu_zone, Some(2));
    }
}
