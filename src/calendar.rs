use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    /// Normalizes user-facing spellings (English or Spanish, any case,
    /// with or without accents, 3-letter abbreviations, ISO 1..=7).
    pub fn parse(raw: &str) -> Option<Self> {
        let folded: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| match c {
                'á' | 'à' => 'a',
                'é' | 'è' => 'e',
                'í' | 'ì' => 'i',
                'ó' | 'ò' => 'o',
                'ú' | 'ù' | 'ü' => 'u',
                other => other,
            })
            .collect();
        match folded.as_str() {
            "monday" | "mon" | "lunes" | "lun" | "1" => Some(Self::Monday),
            "tuesday" | "tue" | "martes" | "mar" | "2" => Some(Self::Tuesday),
            "wednesday" | "wed" | "miercoles" | "mie" | "3" => Some(Self::Wednesday),
            "thursday" | "thu" | "jueves" | "jue" | "4" => Some(Self::Thursday),
            "friday" | "fri" | "viernes" | "vie" | "5" => Some(Self::Friday),
            "saturday" | "sat" | "sabado" | "sab" | "6" => Some(Self::Saturday),
            "sunday" | "sun" | "domingo" | "dom" | "7" => Some(Self::Sunday),
            _ => None,
        }
    }

    pub fn parse_required(raw: &str) -> CoreResult<Self> {
        Self::parse(raw).ok_or_else(|| CoreError::validation(format!("unknown weekday: {}", raw)))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "monday",
            Self::Tuesday => "tuesday",
            Self::Wednesday => "wednesday",
            Self::Thursday => "thursday",
            Self::Friday => "friday",
            Self::Saturday => "saturday",
            Self::Sunday => "sunday",
        }
    }

    pub fn to_chrono(self) -> chrono::Weekday {
        match self {
            Self::Monday => chrono::Weekday::Mon,
            Self::Tuesday => chrono::Weekday::Tue,
            Self::Wednesday => chrono::Weekday::Wed,
            Self::Thursday => chrono::Weekday::Thu,
            Self::Friday => chrono::Weekday::Fri,
            Self::Saturday => chrono::Weekday::Sat,
            Self::Sunday => chrono::Weekday::Sun,
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self::ALL[date.weekday().num_days_from_monday() as usize]
    }
}

/// Every date in `[start, end]` falling on one weekday, earliest first.
#[derive(Debug, Clone)]
pub struct WeekdayDates {
    next: Option<NaiveDate>,
    end: NaiveDate,
}

impl Iterator for WeekdayDates {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let cur = self.next?;
        if cur > self.end {
            self.next = None;
            return None;
        }
        self.next = cur.checked_add_signed(Duration::days(7));
        Some(cur)
    }
}

pub fn dates_for_weekday(weekday: Weekday, start: NaiveDate, end: NaiveDate) -> WeekdayDates {
    if start > end {
        return WeekdayDates { next: None, end };
    }
    let from = start.weekday().num_days_from_monday() as i64;
    let to = weekday.to_chrono().num_days_from_monday() as i64;
    let offset = (to - from).rem_euclid(7);
    WeekdayDates {
        next: start.checked_add_signed(Duration::days(offset)),
        end,
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

pub fn month_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let first = date.with_day(1).unwrap_or(date);
    let next_first = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    };
    let last = next_first
        .and_then(|d| d.pred_opt())
        .unwrap_or(date);
    (first, last)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).expect("date")
    }

    fn brute_force(weekday: Weekday, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut cur = start;
        while cur <= end {
            if Weekday::of(cur) == weekday {
                out.push(cur);
            }
            cur = cur.succ_opt().expect("succ");
        }
        out
    }

    #[test]
    fn january_2026_tuesdays() {
        let got: Vec<_> =
            dates_for_weekday(Weekday::Tuesday, d("2026-01-01"), d("2026-01-31")).collect();
        assert_eq!(
            got,
            vec![d("2026-01-06"), d("2026-01-13"), d("2026-01-20"), d("2026-01-27")]
        );
    }

    #[test]
    fn matches_day_by_day_scan_for_every_weekday_and_many_ranges() {
        let base = d("2025-12-20");
        for start_off in 0..20i64 {
            for len in 0..75i64 {
                let start = base + Duration::days(start_off);
                let end = start + Duration::days(len);
                for w in Weekday::ALL {
                    let got: Vec<_> = dates_for_weekday(w, start, end).collect();
                    assert_eq!(got, brute_force(w, start, end), "{:?} {} {}", w, start, end);
                }
            }
        }
    }

    #[test]
    fn inverted_range_is_empty_not_error() {
        assert_eq!(
            dates_for_weekday(Weekday::Monday, d("2026-02-10"), d("2026-02-01")).count(),
            0
        );
    }

    #[test]
    fn single_day_range() {
        // 2026-01-06 is a Tuesday.
        assert_eq!(
            dates_for_weekday(Weekday::Tuesday, d("2026-01-06"), d("2026-01-06")).count(),
            1
        );
        assert_eq!(
            dates_for_weekday(Weekday::Monday, d("2026-01-06"), d("2026-01-06")).count(),
            0
        );
    }

    #[test]
    fn enumerator_is_restartable() {
        let it = dates_for_weekday(Weekday::Friday, d("2026-03-01"), d("2026-03-31"));
        let first: Vec<_> = it.clone().collect();
        let second: Vec<_> = it.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn weekday_spellings_normalize() {
        assert_eq!(Weekday::parse("Miércoles"), Some(Weekday::Wednesday));
        assert_eq!(Weekday::parse("miercoles"), Some(Weekday::Wednesday));
        assert_eq!(Weekday::parse(" SÁBADO "), Some(Weekday::Saturday));
        assert_eq!(Weekday::parse("thu"), Some(Weekday::Thursday));
        assert_eq!(Weekday::parse("7"), Some(Weekday::Sunday));
        assert_eq!(Weekday::parse("someday"), None);
        assert!(Weekday::parse_required("x").is_err());
    }

    #[test]
    fn month_bounds_handle_december_and_leap_february() {
        assert_eq!(month_bounds(d("2026-12-15")), (d("2026-12-01"), d("2026-12-31")));
        assert_eq!(month_bounds(d("2028-02-03")), (d("2028-02-01"), d("2028-02-29")));
    }
}
