//! Generic version ordering.
//!
//! Accepts any input string and applies common-sense ordering: tokens split
//! on `.`/`-`/`_` and on digit boundaries, numeric runs compared as numbers,
//! known pre-release qualifiers ordered below the release they qualify, and
//! `min`/`max` sentinels that bound every other version sharing a prefix.
//!
//! The comparator is total: any two strings compare, and the original input
//! is preserved byte-for-byte by [`Version::as_str`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use num_bigint::BigUint;

mod range;

pub use range::{Bound, VersionRange, VersionRangeError};

/// A parsed version: the original string plus its tokenized items.
#[derive(Clone, Debug)]
pub struct Version {
    version: String,
    items: Vec<Item>,
}

impl Version {
    /// Parses a version string. Never fails: every string has an ordering.
    pub fn parse(version: impl Into<String>) -> Self {
        let version = version.into();
        let items = parse_items(&version);
        Self { version, items }
    }

    /// The backing string, byte-for-byte as given.
    pub fn as_str(&self) -> &str {
        &self.version
    }

    /// The tokenized representation.
    pub fn items(&self) -> &[Item] {
        &self.items
    }
}

/// Total-order comparison of two version strings.
pub fn compare(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.version)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.items.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let these = &self.items;
        let those = &other.items;

        // Tracks the kind-class of the last pair that compared equal; the
        // sequence is considered numeric until proven otherwise.
        let mut number = true;

        let mut index = 0;
        loop {
            if index >= these.len() && index >= those.len() {
                return Ordering::Equal;
            } else if index >= these.len() {
                return compare_padding(those, index, None).reverse();
            } else if index >= those.len() {
                return compare_padding(these, index, None);
            }

            let this_item = &these[index];
            let that_item = &those[index];

            if this_item.is_number() != that_item.is_number() {
                if index == 0 {
                    return this_item.cmp_item(that_item);
                }
                if number == this_item.is_number() {
                    return compare_padding(these, index, Some(number));
                } else {
                    return compare_padding(those, index, Some(number)).reverse();
                }
            } else {
                let rel = this_item.cmp_item(that_item);
                if rel != Ordering::Equal {
                    return rel;
                }
                number = this_item.is_number();
            }

            index += 1;
        }
    }
}

/// Compares the tail of `items` starting at `index` against padding. When
/// `number` is set, items of the opposite kind-class are skipped rather than
/// terminating the walk.
fn compare_padding(items: &[Item], index: usize, number: Option<bool>) -> Ordering {
    let mut rel = Ordering::Equal;
    for item in &items[index..] {
        if let Some(num) = number
            && num != item.is_number()
        {
            continue;
        }
        rel = item.cmp_null();
        if rel != Ordering::Equal {
            break;
        }
    }
    rel
}

fn parse_items(version: &str) -> Vec<Item> {
    let mut items = Vec::new();

    let mut tokenizer = Tokenizer::new(version);
    while tokenizer.next() {
        items.push(tokenizer.to_item());
    }

    trim_padding(&mut items);

    items
}

/// Removes trailing items that compare equal to padding at the end of each
/// same-kind run, preserving the run that directly precedes a kind
/// transition. The leading item is never removed.
fn trim_padding(items: &mut Vec<Item>) {
    let mut number: Option<bool> = None;
    let mut end = items.len().wrapping_sub(1);
    let mut i = end;
    while i > 0 && i < items.len() {
        let is_number = items[i].is_number();
        if Some(is_number) != number {
            end = i;
            number = Some(is_number);
        }
        if end == i
            && (i == items.len() - 1 || items[i - 1].is_number() == is_number)
            && items[i].cmp_null() == Ordering::Equal
        {
            items.remove(i);
            end = end.wrapping_sub(1);
        }
        i -= 1;
    }
}

const QUALIFIER_ALPHA: i32 = -5;
const QUALIFIER_BETA: i32 = -4;
const QUALIFIER_MILESTONE: i32 = -3;

fn qualifier_weight(token: &str) -> Option<i32> {
    match token.to_ascii_lowercase().as_str() {
        "alpha" => Some(QUALIFIER_ALPHA),
        "beta" => Some(QUALIFIER_BETA),
        "milestone" => Some(QUALIFIER_MILESTONE),
        "cr" | "rc" => Some(-2),
        "snapshot" => Some(-1),
        "ga" | "final" | "release" | "" => Some(0),
        "sp" => Some(1),
        _ => None,
    }
}

/// One tokenized element of a version.
#[derive(Clone, Debug, Eq, Hash)]
pub enum Item {
    /// Sentinel below any padding; produced only by a trailing `min` token.
    Min,
    /// Known pre-release/release label, by weight.
    Qualifier(i32),
    /// Unknown qualifier, lower-cased.
    Str(String),
    /// Numeric token of at most nine decimal digits.
    Int(u32),
    /// Numeric token wider than nine decimal digits.
    BigInt(BigUint),
    /// Sentinel above any padding; produced only by a trailing `max` token.
    Max,
}

impl Item {
    fn kind(&self) -> u8 {
        match self {
            Item::Min => 0,
            Item::Qualifier(_) => 2,
            Item::Str(_) => 3,
            Item::Int(_) => 4,
            Item::BigInt(_) => 5,
            Item::Max => 8,
        }
    }

    /// Numeric kind-class: everything except qualifiers and strings.
    pub fn is_number(&self) -> bool {
        self.kind() & 2 == 0
    }

    /// Comparison against the padding element (a conceptual `0`/`ga`).
    fn cmp_null(&self) -> Ordering {
        match self {
            Item::Min => Ordering::Less,
            Item::Max | Item::BigInt(_) | Item::Str(_) => Ordering::Greater,
            Item::Int(n) => n.cmp(&0),
            Item::Qualifier(q) => q.cmp(&0),
        }
    }

    fn cmp_item(&self, that: &Item) -> Ordering {
        let rel = self.kind().cmp(&that.kind());
        if rel != Ordering::Equal {
            return rel;
        }
        match (self, that) {
            (Item::Min, Item::Min) | (Item::Max, Item::Max) => Ordering::Equal,
            (Item::BigInt(a), Item::BigInt(b)) => a.cmp(b),
            (Item::Int(a), Item::Int(b)) => a.cmp(b),
            (Item::Qualifier(a), Item::Qualifier(b)) => a.cmp(b),
            // Tokens are stored lower-cased, so a plain comparison is
            // case-insensitive here.
            (Item::Str(a), Item::Str(b)) => a.cmp(b),
            _ => unreachable!("kind ordinals matched"),
        }
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_item(other) == Ordering::Equal
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Min => f.write_str("min"),
            Item::Max => f.write_str("max"),
            Item::Qualifier(q) => write!(f, "{q}"),
            Item::Str(s) => f.write_str(s),
            Item::Int(n) => write!(f, "{n}"),
            Item::BigInt(n) => write!(f, "{n}"),
        }
    }
}

/// Single forward pass over the version string. A run is either all ASCII
/// digits or all other characters; a run ends at a separator or at a
/// digit/non-digit boundary.
struct Tokenizer<'a> {
    version: &'a str,
    len: usize,
    index: usize,
    token: &'a str,
    number: bool,
    terminated_by_number: bool,
}

impl<'a> Tokenizer<'a> {
    fn new(version: &'a str) -> Self {
        let version = if version.is_empty() { "0" } else { version };
        Self {
            version,
            len: version.len(),
            index: 0,
            token: "0",
            number: true,
            terminated_by_number: false,
        }
    }

    fn next(&mut self) -> bool {
        if self.index >= self.len {
            return false;
        }

        let bytes = self.version.as_bytes();

        // state: -2 initial, -1 inside a non-digit run, 0 inside a run of
        // leading zeros, 1 inside a digit run with a significant digit seen.
        let mut state: i32 = -2;

        let mut start = self.index;
        let mut end = self.len;
        self.terminated_by_number = false;

        while self.index < self.len {
            let c = bytes[self.index];

            if c == b'.' || c == b'-' || c == b'_' {
                end = self.index;
                self.index += 1;
                break;
            } else if c.is_ascii_digit() {
                if state == -1 {
                    end = self.index;
                    self.terminated_by_number = true;
                    break;
                }
                if state == 0 {
                    // strip leading zeros before numeric conversion
                    start += 1;
                }
                state = if state > 0 || c > b'0' { 1 } else { 0 };
                self.index += 1;
            } else {
                if state >= 0 {
                    end = self.index;
                    break;
                }
                state = -1;
                self.index += 1;
            }
        }

        if end > start {
            // Slice boundaries always fall on ASCII separators or digits, so
            // this never splits a multi-byte character.
            self.token = &self.version[start..end];
            self.number = state >= 0;
        } else {
            self.token = "0";
            self.number = true;
        }

        true
    }

    fn to_item(&self) -> Item {
        if self.number {
            if self.token.len() < 10 {
                let value = self
                    .token
                    .parse::<u32>()
                    .expect("digit run of at most nine digits fits in u32");
                Item::Int(value)
            } else {
                let value = BigUint::parse_bytes(self.token.as_bytes(), 10)
                    .expect("digit run is a valid base-10 number");
                Item::BigInt(value)
            }
        } else {
            if self.index >= self.len {
                if self.token.eq_ignore_ascii_case("min") {
                    return Item::Min;
                } else if self.token.eq_ignore_ascii_case("max") {
                    return Item::Max;
                }
            }
            if self.terminated_by_number && self.token.len() == 1 {
                match self.token.as_bytes()[0] {
                    b'a' | b'A' => return Item::Qualifier(QUALIFIER_ALPHA),
                    b'b' | b'B' => return Item::Qualifier(QUALIFIER_BETA),
                    b'm' | b'M' => return Item::Qualifier(QUALIFIER_MILESTONE),
                    _ => {}
                }
            }
            match qualifier_weight(self.token) {
                Some(weight) => Item::Qualifier(weight),
                None => Item::Str(self.token.to_lowercase()),
            }
        }
    }
}
