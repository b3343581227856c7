//! Unix time to calendar fields.
//!
//! The date part uses Howard Hinnant's `civil_from_days`
//! (<http://howardhinnant.github.io/date_algorithms.html>), which counts years
//! from March 1st so that the leap day is the last day of its internal year.

/// Days from 0000-03-01 to 1970-01-01.
const DAYS_TO_UNIX_EPOCH: u32 = 719_468;
/// Days in a 400 year Gregorian cycle.
const DAYS_PER_ERA: u32 = 146_097;
/// 1970-01-01 was a Thursday.
const EPOCH_WEEKDAY: u32 = 4;
/// January and February, which the March based year puts at its end.
const DAYS_IN_JAN_FEB: u32 = 31 + 28;
const MARCH_BASED_JAN_1: u32 = 306;

/// Broken down local time, after the daylight saving adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarFields {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub year: u32,
    /// 1 = January.
    pub month: u8,
    pub day: u8,
    /// 0 = Sunday.
    pub weekday: u8,
    /// 0 = January 1st.
    pub day_of_year: u16,
    pub is_dst: bool,
}

impl core::fmt::Display for CalendarFields {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

pub fn is_leap(year: u32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// European summer time, approximated from the date alone.
///
/// Summer time starts on the last Sunday of March and ends on the last Sunday of
/// October; both fall on the 25th or later. The switch is taken to happen at
/// midnight rather than 01:00 UTC.
pub fn is_dst(month: u8, day: u8, weekday: u8) -> bool {
    let last_sunday = i32::from(day) - i32::from(weekday);
    match month {
        4..=9 => true,
        3 => last_sunday >= 25,
        10 => last_sunday < 25,
        _ => false,
    }
}

pub fn breakdown(epoch_seconds: u32) -> CalendarFields {
    let mut time = epoch_seconds;
    let second = (time % 60) as u8;
    time /= 60;
    let minute = (time % 60) as u8;
    time /= 60;
    let mut hour = (time % 24) as u8;
    let days = time / 24;

    let mut weekday = ((days + EPOCH_WEEKDAY) % 7) as u8;

    let shifted = days + DAYS_TO_UNIX_EPOCH;
    let era = shifted / DAYS_PER_ERA;
    let day_of_era = shifted - era * DAYS_PER_ERA;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let march_day = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * march_day + 2) / 153;
    let mut day = (march_day - (153 * mp + 2) / 5 + 1) as u8;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;

    let mut year = year_of_era + era * 400;
    if month <= 2 {
        year += 1;
    }

    let mut day_of_year = if month <= 2 {
        march_day - MARCH_BASED_JAN_1
    } else {
        march_day + DAYS_IN_JAN_FEB + u32::from(is_leap(year))
    } as u16;

    let is_dst = is_dst(month, day, weekday);
    if is_dst {
        hour += 1;
    }
    if hour > 23 {
        // Only hour and minute are shown, so month and year rollover are not
        // applied: day and day_of_year can run one past the end of the month.
        hour = 0;
        weekday = (weekday + 1) % 7;
        day += 1;
        day_of_year += 1;
    }

    CalendarFields {
        second,
        minute,
        hour,
        year,
        month,
        day,
        weekday,
        day_of_year,
        is_dst,
    }
}
