use crate::error::{BackupError, Result};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;


/// One criterion of a retention expression: how densely to retain items
/// once they are older than `age`.
///
/// Written as `<age>:<retention>` where age is `<n>[h|d|w|m|y]` (hours when
/// the unit is omitted) and retention is one of:
///
/// * a static number (`10`): that many, no thinning by time,
/// * `<n>/<unit>` (`4/d`): n per unit,
/// * `<n>/<m><unit>` (`2/4d`): n per m units,
/// * a unit word (`daily`, `weekly`, ..): one per unit,
/// * `none`: zero.
///
/// A whole condition may also be a bare integer, which reads as a static
/// number applying immediately (`age` 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    age: Duration,
    interval_duration: Option<Duration>,
    interval_amount: usize,
    text: String,
}

static AGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^([0-9]+)([hdwmy])?$").unwrap());
static RETAIN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^([0-9]+)(/([0-9]+)?([hdwmy]))?$").unwrap());

fn unit_duration(unit: char) -> Option<Duration> {
    match unit.to_ascii_lowercase() {
        'h' => Some(Duration::hours(1)),
        'd' => Some(Duration::days(1)),
        'w' => Some(Duration::days(7)),
        'm' => Some(Duration::days(30)),
        'y' => Some(Duration::days(365)),
        _ => None,
    }
}

impl Condition {
    fn parse(text: &str) -> Result<Condition> {
        let text = text.trim();
        let invalid = || BackupError::InvalidRetention(text.into());

        let (age_literal, retain_literal) = match text.split_once(':') {
            None => {
                // a bare integer is a static amount applying immediately
                let amount = text.parse::<usize>().map_err(|_| invalid())?;
                return Ok(Condition {
                    age: Duration::zero(),
                    interval_duration: None,
                    interval_amount: amount,
                    text: text.into(),
                });
            }
            Some((age, retain)) => (age.trim(), retain.trim()),
        };

        let age_captures = AGE_REGEX.captures(age_literal).ok_or_else(invalid)?;
        let age_amount = age_captures[1].parse::<i64>().map_err(|_| invalid())?;
        let age = match age_captures.get(2) {
            Some(unit) => {
                let unit = unit.as_str().chars().next().ok_or_else(invalid)?;
                unit_duration(unit).ok_or_else(invalid)? * age_amount as i32
            }
            None => Duration::hours(age_amount),
        };

        let first = retain_literal.chars().next().ok_or_else(invalid)?;
        let (interval_duration, interval_amount) = match "hdwmyn".contains(first) {
            // unit words: "daily" is one per day, "none" is zero
            true => {
                let interval_duration = unit_duration(first);
                let interval_amount = match interval_duration {
                    Some(_) => 1,
                    None => 0,
                };
                (interval_duration, interval_amount)
            }
            false => {
                let captures = RETAIN_REGEX.captures(retain_literal).ok_or_else(invalid)?;
                let amount = captures[1].parse::<usize>().map_err(|_| invalid())?;

                let duration = match captures.get(4) {
                    None => None,
                    Some(unit) => {
                        let multiplier = match captures.get(3) {
                            Some(m) => m.as_str().parse::<i32>().map_err(|_| invalid())?,
                            None => 1,
                        };
                        let unit = unit.as_str().chars().next().ok_or_else(invalid)?;
                        Some(unit_duration(unit).ok_or_else(invalid)? * multiplier)
                    }
                };

                (duration, amount)
            }
        };

        Ok(Condition {
            age,
            interval_duration,
            interval_amount,
            text: text.into(),
        })
    }

    pub fn age(&self) -> Duration {
        self.age
    }

    pub fn interval_duration(&self) -> Option<Duration> {
        self.interval_duration
    }

    pub fn interval_amount(&self) -> usize {
        self.interval_amount
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Ordered set of retention conditions describing an age-banded thinning
/// policy, e.g. `1d:4/d, 1w:daily, 1m:1/w, 2m:none`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionExpression {
    conditions: Vec<Condition>,
    text: String,
}

/// Age band derived from one condition, relative to a reference time.
struct Band {
    condition: usize,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    /// Sub-interval width; for a static amount in a bounded band this is
    /// the band width, `None` means a flat top-N over the final band.
    interval: Option<Duration>,
    amount: usize,
}

impl RetentionExpression {
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Partition `items` into those to remove, grouped by the condition
    /// that selected them, and those to retain.
    ///
    /// The reference time is passed in so the result is a pure function of
    /// its inputs. Items newer than the youngest condition's age are always
    /// retained.
    pub fn filter<T, F>(
        &self,
        items: &[T],
        now: DateTime<Utc>,
        timestamp: F,
    ) -> (Vec<(Condition, Vec<T>)>, Vec<T>)
    where
        T: Clone,
        F: Fn(&T) -> DateTime<Utc>,
    {
        if self.conditions.is_empty() {
            return (Vec::new(), items.to_vec());
        }

        if items.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let mut items: Vec<T> = items.to_vec();
        items.sort_by(|a, b| timestamp(b).cmp(&timestamp(a)));

        let mut bands: VecDeque<Band> = self
            .conditions
            .iter()
            .enumerate()
            .map(|(i, condition)| {
                let start = now - condition.age;
                let end = self.conditions.get(i + 1).map(|next| now - next.age);
                let interval = match condition.interval_duration {
                    Some(duration) => Some(duration),
                    // static amount: the sub-interval is the whole band
                    None => end.map(|end| start - end),
                };

                Band {
                    condition: i,
                    start,
                    end,
                    interval,
                    amount: condition.interval_amount,
                }
            })
            .collect();

        let mut retained: Vec<T> = Vec::new();
        let mut removed: Vec<(usize, Vec<T>)> = Vec::new();

        // items newer than the first condition's age are kept unconditionally
        let first_start = now - self.conditions[0].age;
        let mut remaining: Vec<T> = Vec::new();
        for item in items {
            if timestamp(&item) > first_start {
                retained.push(item);
            } else {
                remaining.push(item);
            }
        }
        let mut items = remaining;

        while !items.is_empty() {
            let band = match bands.front() {
                Some(band) => band,
                None => break,
            };

            let newest = timestamp(&items[0]);

            if newest > band.start || band.end.map_or(false, |end| newest <= end) {
                bands.pop_front();
                continue;
            }

            match band.interval {
                None => {
                    // flat top-N over the rest
                    let keep = band.amount.min(items.len());
                    retained.extend(items.drain(..keep));
                    if !items.is_empty() {
                        push_removed(&mut removed, band.condition, items.drain(..).collect());
                    }
                }
                Some(interval) => {
                    let interval_seconds = interval.num_seconds().max(1);
                    let offset = (band.start - newest).num_seconds();
                    let tile = offset.div_euclid(interval_seconds);
                    let tile_start = band.start - Duration::seconds(tile * interval_seconds);
                    let tile_end = tile_start - interval;

                    let mut in_tile: Vec<T> = Vec::new();
                    let mut rest: Vec<T> = Vec::new();
                    for item in items.drain(..) {
                        let ts = timestamp(&item);
                        if ts <= tile_start && ts > tile_end {
                            in_tile.push(item);
                        } else {
                            rest.push(item);
                        }
                    }
                    items = rest;

                    // Reverse before reducing so the oldest item represents a
                    // narrow tile; otherwise a newer item would be re-picked on
                    // every run and items inside the tile would never age.
                    in_tile.reverse();
                    let (keep, drop) = reduce(in_tile, band.amount);
                    retained.extend(keep);
                    if !drop.is_empty() {
                        push_removed(&mut removed, band.condition, drop);
                    }
                }
            }
        }

        let removed = removed
            .into_iter()
            .map(|(i, dropped)| (self.conditions[i].clone(), dropped))
            .collect();

        (removed, retained)
    }
}

fn push_removed<T>(removed: &mut Vec<(usize, Vec<T>)>, condition: usize, mut items: Vec<T>) {
    match removed.last_mut() {
        Some((last, existing)) if *last == condition => existing.append(&mut items),
        _ => removed.push((condition, items)),
    }
}

/// Reduce a list to at most `max_amount` items, evenly spaced.
fn reduce<T>(items: Vec<T>, max_amount: usize) -> (Vec<T>, Vec<T>) {
    if max_amount == 0 {
        return (Vec::new(), items);
    }

    if items.len() <= max_amount {
        return (items, Vec::new());
    }

    let len = items.len() as f64;
    let mut to_retain = Vec::new();
    let mut to_remove = Vec::new();

    let mut position = len / (max_amount as f64 + 1.0) - 1.0;
    let step = len / max_amount as f64;
    let mut next_index = round_half_even(position);

    for (i, item) in items.into_iter().enumerate() {
        if i as i64 == next_index {
            to_retain.push(item);
            position += step;
            next_index = round_half_even(position);
        } else {
            to_remove.push(item);
        }
    }

    (to_retain, to_remove)
}

fn round_half_even(value: f64) -> i64 {
    let floor = value.floor();

    if value - floor == 0.5 {
        let floor = floor as i64;
        match floor % 2 == 0 {
            true => floor,
            false => floor + 1,
        }
    } else {
        value.round() as i64
    }
}

impl FromStr for RetentionExpression {
    type Err = BackupError;

    fn from_str(expression: &str) -> Result<Self> {
        let criteria: Vec<&str> = expression.split(',').map(|c| c.trim()).collect();
        let text = criteria.join(", ");

        let mut conditions = criteria
            .iter()
            .map(|c| Condition::parse(c))
            .collect::<Result<Vec<Condition>>>()?;

        conditions.sort_by(|a, b| a.age.cmp(&b.age));

        Ok(RetentionExpression { conditions, text })
    }
}

impl fmt::Display for RetentionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}
