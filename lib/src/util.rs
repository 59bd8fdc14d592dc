use crate::ArcStr;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer};
use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

// Helpers for serde to parse fields with quirks.

/// Parse a string, but map "null" to `None` (in addition to the default "" -> None mapping)
pub fn optional_string<'de, D>(d: D) -> Result<Option<ArcStr>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(d)?;
    Ok(s.and_then(|s| {
        let s = s.trim();
        if s.eq_ignore_ascii_case("null") || s.is_empty() {
            None
        } else {
            Some(s.into())
        }
    }))
}

/// Parse a date trying each format in turn.
///
/// Formats with a time part (`%H`) are accepted only when the time is midnight, which is how date
/// only fields come out of some extracts (`17/11/2021 00:00:00`). Anything else means the column
/// isn't what we think it is.
pub fn parse_date(input: &str, formats: &[String]) -> Option<NaiveDate> {
    let input = input.trim();
    formats.iter().find_map(|format| {
        if format.contains("%H") {
            let datetime = NaiveDateTime::parse_from_str(input, format).ok()?;
            if datetime.hour() != 0 || datetime.minute() != 0 || datetime.second() != 0 {
                return None;
            }
            Some(datetime.date())
        } else {
            NaiveDate::parse_from_str(input, format).ok()
        }
    })
}

/// Print a title with an underline, for separating sections of output.
pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}

#[cfg(test)]
mod test {
    use super::parse_date;
    use chrono::NaiveDate;

    #[test]
    fn dates() {
        let formats = vec![
            "%Y-%m-%d".to_owned(),
            "%d/%m/%Y %H:%M:%S".to_owned(),
        ];
        let expected = NaiveDate::from_ymd_opt(2021, 11, 17);
        assert_eq!(parse_date("2021-11-17", &formats), expected);
        assert_eq!(parse_date(" 17/11/2021 00:00:00", &formats), expected);
        assert_eq!(parse_date("17/11/2021 09:30:00", &formats), None);
        assert_eq!(parse_date("2021-02-30", &formats), None);
        assert_eq!(parse_date("", &formats), None);
    }
}
