/*! Molecular formulas over a fixed element alphabet.

A [`MolecularFormula`] is a dense vector of element counts. Counts are signed so
that differences between formulas can be formed and then checked, but every formula
produced by parsing or by [`MolecularFormula::checked_sub`] is non-negative.

Monoisotopic element masses are taken from [`chemical_elements`] once and cached.
*/
use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::Hash;
use std::ops::{Add, Index, Sub};
use std::str::FromStr;
use std::sync::OnceLock;

use chemical_elements::{ChemicalComposition, ElementSpecification};
use thiserror::Error;

/// The number of elements a [`MolecularFormula`] can hold
pub const NUM_ELEMENTS: usize = 15;

/// The element symbols, in storage order
pub const ELEMENTS: [&str; NUM_ELEMENTS] = [
    "C", "H", "N", "O", "P", "S", "F", "Cl", "Br", "I", "Si", "Se", "B", "Na", "K",
];

/// The valence used for ring-double-bond-equivalent computation, in storage order
const VALENCES: [i32; NUM_ELEMENTS] = [4, 1, 3, 2, 3, 2, 1, 1, 1, 1, 4, 2, 3, 1, 1];

/// Storage indices in Hill order: carbon, hydrogen, then alphabetical
const HILL_ORDER: [usize; NUM_ELEMENTS] = [0, 1, 12, 8, 7, 6, 9, 14, 2, 13, 3, 4, 5, 11, 10];

pub type ElementCount = i16;

static ELEMENT_MASSES: OnceLock<[f64; NUM_ELEMENTS]> = OnceLock::new();

/// The monoisotopic masses of [`ELEMENTS`], in storage order
pub fn element_masses() -> &'static [f64; NUM_ELEMENTS] {
    ELEMENT_MASSES.get_or_init(|| {
        let mut masses = [0.0; NUM_ELEMENTS];
        for (mass, symbol) in masses.iter_mut().zip(ELEMENTS) {
            let element = ElementSpecification::parse(symbol).unwrap();
            let mut composition = ChemicalComposition::new();
            composition.set(element, 1);
            *mass = composition.mass();
        }
        masses
    })
}

/// Look up the storage index of an element symbol
pub fn element_index(symbol: &str) -> Option<usize> {
    ELEMENTS.iter().position(|s| *s == symbol)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaParseError {
    #[error("Unknown element symbol {0:?}")]
    UnknownElement(String),
    #[error("Unexpected character {0:?} at position {1}")]
    UnexpectedCharacter(char, usize),
    #[error("Element count for {0} is out of range")]
    CountOutOfRange(String),
}

/// A molecular formula as a vector of element counts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MolecularFormula {
    counts: [ElementCount; NUM_ELEMENTS],
}

impl MolecularFormula {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_counts(counts: [ElementCount; NUM_ELEMENTS]) -> Self {
        Self { counts }
    }

    /// Parse a formula like `C6H12O6`. This is the same as [`FromStr`].
    pub fn parse(s: &str) -> Result<Self, FormulaParseError> {
        s.parse()
    }

    pub fn counts(&self) -> &[ElementCount; NUM_ELEMENTS] {
        &self.counts
    }

    pub fn get(&self, symbol: &str) -> ElementCount {
        element_index(symbol).map(|i| self.counts[i]).unwrap_or_default()
    }

    pub fn set(&mut self, index: usize, count: ElementCount) {
        self.counts[index] = count;
    }

    /// The monoisotopic mass of this formula
    pub fn mass(&self) -> f64 {
        let masses = element_masses();
        self.counts
            .iter()
            .zip(masses.iter())
            .map(|(c, m)| *c as f64 * m)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|c| *c == 0)
    }

    pub fn is_non_negative(&self) -> bool {
        self.counts.iter().all(|c| *c >= 0)
    }

    /// Compare the Hill notation strings of two formulas
    pub fn hill_cmp(&self, other: &Self) -> Ordering {
        if self.counts == other.counts {
            return Ordering::Equal;
        }
        self.to_string().cmp(&other.to_string())
    }

    /// Check whether every element count of `self` is at most the count in `other`
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.counts
            .iter()
            .zip(other.counts.iter())
            .all(|(a, b)| a <= b)
    }

    /// Subtract `other` from `self`, returning `None` if any element would become negative
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        let mut counts = self.counts;
        for (c, o) in counts.iter_mut().zip(other.counts.iter()) {
            *c -= *o;
            if *c < 0 {
                return None;
            }
        }
        Some(Self { counts })
    }

    /// The ring-double-bond-equivalent of this formula.
    ///
    /// $$ RDBE = 1 + \frac{1}{2}\sum_i n_i (v_i - 2) $$
    pub fn rdbe(&self) -> f64 {
        let s: i32 = self
            .counts
            .iter()
            .zip(VALENCES.iter())
            .map(|(c, v)| *c as i32 * (v - 2))
            .sum();
        1.0 + s as f64 / 2.0
    }

    /// Iterate over `(symbol, count)` pairs with non-zero counts in Hill order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, ElementCount)> + '_ {
        HILL_ORDER
            .iter()
            .map(|i| (ELEMENTS[*i], self.counts[*i]))
            .filter(|(_, c)| *c != 0)
    }
}

impl Index<usize> for MolecularFormula {
    type Output = ElementCount;

    fn index(&self, index: usize) -> &Self::Output {
        &self.counts[index]
    }
}

impl Add for MolecularFormula {
    type Output = MolecularFormula;

    fn add(mut self, rhs: Self) -> Self::Output {
        for (c, o) in self.counts.iter_mut().zip(rhs.counts.iter()) {
            *c += *o;
        }
        self
    }
}

impl Sub for MolecularFormula {
    type Output = MolecularFormula;

    fn sub(mut self, rhs: Self) -> Self::Output {
        for (c, o) in self.counts.iter_mut().zip(rhs.counts.iter()) {
            *c -= *o;
        }
        self
    }
}

impl Display for MolecularFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (symbol, count) in self.iter() {
            if count == 1 {
                f.write_str(symbol)?;
            } else {
                write!(f, "{symbol}{count}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MolecularFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MolecularFormula({self})")
    }
}

impl PartialOrd for MolecularFormula {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Formulas are ordered by their element counts in storage order. See
/// [`MolecularFormula::hill_cmp`] for the alphabetical order of their notation.
impl Ord for MolecularFormula {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counts.cmp(&other.counts)
    }
}

impl FromStr for MolecularFormula {
    type Err = FormulaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut counts = [0 as ElementCount; NUM_ELEMENTS];
        let chars: Vec<char> = s.trim().chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if !c.is_ascii_uppercase() {
                return Err(FormulaParseError::UnexpectedCharacter(c, i));
            }
            let mut symbol = String::from(c);
            i += 1;
            while i < chars.len() && chars[i].is_ascii_lowercase() {
                symbol.push(chars[i]);
                i += 1;
            }
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let count: ElementCount = if start == i {
                1
            } else {
                let digits: String = chars[start..i].iter().collect();
                digits
                    .parse()
                    .map_err(|_| FormulaParseError::CountOutOfRange(symbol.clone()))?
            };
            let index =
                element_index(&symbol).ok_or(FormulaParseError::UnknownElement(symbol.clone()))?;
            counts[index] = counts[index]
                .checked_add(count)
                .ok_or(FormulaParseError::CountOutOfRange(symbol))?;
        }
        Ok(Self { counts })
    }
}

/// A candidate neutral formula for a spectrum, optionally scored by whatever
/// produced it
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CandidateFormula {
    pub formula: MolecularFormula,
    #[cfg_attr(feature = "serde", serde(default))]
    pub prior_score: f64,
}

impl CandidateFormula {
    pub fn new(formula: MolecularFormula, prior_score: f64) -> Self {
        Self {
            formula,
            prior_score,
        }
    }
}

impl From<MolecularFormula> for CandidateFormula {
    fn from(formula: MolecularFormula) -> Self {
        Self::new(formula, 0.0)
    }
}

impl FromStr for CandidateFormula {
    type Err = FormulaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(MolecularFormula::from_str(s)?.into())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for MolecularFormula {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for MolecularFormula {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let f: MolecularFormula = "C6H12O6".parse().unwrap();
        assert_eq!(f.get("C"), 6);
        assert_eq!(f.get("H"), 12);
        assert_eq!(f.get("O"), 6);
        assert_eq!(f.to_string(), "C6H12O6");

        let f: MolecularFormula = "ClC2H5".parse().unwrap();
        assert_eq!(f.to_string(), "C2H5Cl");

        let f: MolecularFormula = "C9H11NO2".parse().unwrap();
        assert_eq!(f.to_string(), "C9H11NO2");

        assert!(matches!(
            "C6Xx2".parse::<MolecularFormula>(),
            Err(FormulaParseError::UnknownElement(_))
        ));
        assert!(matches!(
            "6C".parse::<MolecularFormula>(),
            Err(FormulaParseError::UnexpectedCharacter('6', 0))
        ));
    }

    #[test]
    fn test_mass() {
        let water: MolecularFormula = "H2O".parse().unwrap();
        assert!((water.mass() - 18.010565).abs() < 1e-4, "{}", water.mass());
        let glucose: MolecularFormula = "C6H12O6".parse().unwrap();
        assert!((glucose.mass() - 180.063388).abs() < 1e-4, "{}", glucose.mass());
    }

    #[test]
    fn test_subset_and_subtraction() {
        let glucose: MolecularFormula = "C6H12O6".parse().unwrap();
        let water: MolecularFormula = "H2O".parse().unwrap();
        let ammonia: MolecularFormula = "NH3".parse().unwrap();
        assert!(water.is_subset_of(&glucose));
        assert!(!ammonia.is_subset_of(&glucose));

        let rest = glucose.checked_sub(&water).unwrap();
        assert_eq!(rest.to_string(), "C6H10O5");
        assert!(glucose.checked_sub(&ammonia).is_none());
        assert_eq!(rest + water, glucose);
        assert!(!(water - glucose).is_non_negative());
    }

    #[test]
    fn test_rdbe() {
        let benzene: MolecularFormula = "C6H6".parse().unwrap();
        assert_eq!(benzene.rdbe(), 4.0);
        let methane: MolecularFormula = "CH4".parse().unwrap();
        assert_eq!(methane.rdbe(), 0.0);
        let hydrogen: MolecularFormula = "H2".parse().unwrap();
        assert_eq!(hydrogen.rdbe(), 0.0);
        let pyridine: MolecularFormula = "C5H5N".parse().unwrap();
        assert_eq!(pyridine.rdbe(), 4.0);
    }

    #[test]
    fn test_ordering() {
        let mut formulas: Vec<MolecularFormula> = ["C6H12O6", "C12H22O11", "C6H12O5", "H2O"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        formulas.sort_by(|a, b| a.hill_cmp(b));
        let names: Vec<String> = formulas.iter().map(|f| f.to_string()).collect();
        assert_eq!(names, ["C12H22O11", "C6H12O5", "C6H12O6", "H2O"]);

        formulas.sort();
        let names: Vec<String> = formulas.iter().map(|f| f.to_string()).collect();
        assert_eq!(names, ["H2O", "C6H12O5", "C6H12O6", "C12H22O11"]);
        let copy = formulas[1];
        assert_eq!(formulas[1].cmp(&copy), Ordering::Equal);
        assert_eq!(formulas[0].hill_cmp(&formulas[3]), Ordering::Greater);
    }
}
