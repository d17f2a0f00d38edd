//! Symbolic size expressions.
//!
//! A tensor dimension is an element of a commutative semiring over symbolic
//! size variables and integer literals, kept in a canonical polynomial form
//! (monomial -> coefficient). A distinguished [`SizeExpr::Broadcast`] value
//! means "one element, but extensible under broadcasting"; it behaves as the
//! literal one in arithmetic and only the shape-alignment rules treat it
//! specially.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ShapeError;

/// Names a symbolic size variable (e.g. `N`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeSymbol(Arc<str>);

impl SizeSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SizeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SizeSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SizeSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(SizeSymbol::new(name))
    }
}

/// Monomial over size symbols: each entry is a symbol raised to a positive
/// power. The empty product is the constant one.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SizeProduct {
    factors: BTreeMap<SizeSymbol, u32>,
}

impl SizeProduct {
    pub fn unit() -> Self {
        Self::default()
    }

    pub fn symbol(sym: SizeSymbol) -> Self {
        let mut factors = BTreeMap::new();
        factors.insert(sym, 1);
        Self { factors }
    }

    pub fn is_unit(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &SizeSymbol> {
        self.factors.keys()
    }

    fn mul(&self, other: &SizeProduct) -> SizeProduct {
        let mut factors = self.factors.clone();
        for (sym, power) in &other.factors {
            *factors.entry(sym.clone()).or_insert(0) += power;
        }
        SizeProduct { factors }
    }
}

impl fmt::Display for SizeProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factors.is_empty() {
            return f.write_str("1");
        }
        let mut first = true;
        for (sym, power) in &self.factors {
            if !first {
                f.write_str("*")?;
            }
            first = false;
            if *power == 1 {
                write!(f, "{sym}")?;
            } else {
                write!(f, "{sym}^{power}")?;
            }
        }
        Ok(())
    }
}

/// Canonical multivariate polynomial over size symbols.
///
/// Coefficients are signed so that slice endpoints like `N - 1` stay
/// representable; a size only has to be a natural number once it is
/// evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizePoly {
    terms: BTreeMap<SizeProduct, i64>,
}

impl SizePoly {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn constant(value: i64) -> Self {
        let mut terms = BTreeMap::new();
        if value != 0 {
            terms.insert(SizeProduct::unit(), value);
        }
        Self { terms }
    }

    pub fn symbol(sym: SizeSymbol) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(SizeProduct::symbol(sym), 1);
        Self { terms }
    }

    fn normalized(terms: BTreeMap<SizeProduct, i64>) -> Self {
        let terms = terms.into_iter().filter(|(_, coeff)| *coeff != 0).collect();
        Self { terms }
    }

    pub fn as_constant(&self) -> Option<i64> {
        match self.terms.len() {
            0 => Some(0),
            1 => self.terms.get(&SizeProduct::unit()).copied(),
            _ => None,
        }
    }

    pub fn add(&self, other: &SizePoly) -> SizePoly {
        let mut terms = self.terms.clone();
        for (product, coeff) in &other.terms {
            *terms.entry(product.clone()).or_insert(0) += coeff;
        }
        Self::normalized(terms)
    }

    pub fn sub(&self, other: &SizePoly) -> SizePoly {
        let mut terms = self.terms.clone();
        for (product, coeff) in &other.terms {
            *terms.entry(product.clone()).or_insert(0) -= coeff;
        }
        Self::normalized(terms)
    }

    pub fn mul(&self, other: &SizePoly) -> SizePoly {
        let mut terms: BTreeMap<SizeProduct, i64> = BTreeMap::new();
        for (lp, lc) in &self.terms {
            for (rp, rc) in &other.terms {
                *terms.entry(lp.mul(rp)).or_insert(0) += lc * rc;
            }
        }
        Self::normalized(terms)
    }

    pub fn symbols(&self) -> BTreeSet<SizeSymbol> {
        self.terms
            .keys()
            .flat_map(|product| product.symbols().cloned())
            .collect()
    }

    /// True iff no symbol occurs, i.e. the polynomial is a plain integer.
    pub fn can_eval(&self) -> bool {
        self.terms.keys().all(SizeProduct::is_unit)
    }

    pub fn eval(&self) -> Result<u64, ShapeError> {
        if !self.can_eval() {
            return Err(ShapeError::UnresolvedSymbol {
                symbols: self.symbols().iter().map(|s| s.as_str().to_string()).collect(),
            });
        }
        let value = self.as_constant().unwrap_or(0);
        u64::try_from(value).map_err(|_| ShapeError::NonNaturalSize {
            size: self.to_string(),
        })
    }

    pub fn subst(&self, env: &SymSizeEnv) -> SizePoly {
        let mut result = SizePoly::zero();
        for (product, coeff) in &self.terms {
            let mut term = SizePoly::constant(*coeff);
            for (sym, power) in &product.factors {
                let base = match env.get(sym) {
                    Some(size) => size.to_poly(),
                    None => SizePoly::symbol(sym.clone()),
                };
                for _ in 0..*power {
                    term = term.mul(&base);
                }
            }
            result = result.add(&term);
        }
        result
    }
}

impl fmt::Display for SizePoly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return f.write_str("0");
        }
        let mut first = true;
        for (product, coeff) in &self.terms {
            if !first {
                f.write_str(" + ")?;
            }
            first = false;
            match (product.is_unit(), *coeff) {
                (true, c) => write!(f, "{c}")?,
                (false, 1) => write!(f, "{product}")?,
                (false, c) => write!(f, "{c}*{product}")?,
            }
        }
        Ok(())
    }
}

impl Serialize for SizePoly {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let pairs: Vec<(&SizeProduct, i64)> =
            self.terms.iter().map(|(p, c)| (p, *c)).collect();
        pairs.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SizePoly {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let pairs = Vec::<(SizeProduct, i64)>::deserialize(deserializer)?;
        Ok(SizePoly::normalized(pairs.into_iter().collect()))
    }
}

/// A single tensor dimension.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SizeExpr {
    /// One element, flagged as extensible under broadcasting.
    Broadcast,
    Poly(SizePoly),
}

impl SizeExpr {
    pub fn fixed(value: u64) -> Self {
        SizeExpr::Poly(SizePoly::constant(value as i64))
    }

    pub fn sym(name: impl Into<String>) -> Self {
        SizeExpr::Poly(SizePoly::symbol(SizeSymbol::new(name)))
    }

    pub fn symbol(sym: SizeSymbol) -> Self {
        SizeExpr::Poly(SizePoly::symbol(sym))
    }

    pub fn broadcast() -> Self {
        SizeExpr::Broadcast
    }

    pub fn one() -> Self {
        Self::fixed(1)
    }

    pub fn zero() -> Self {
        Self::fixed(0)
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, SizeExpr::Broadcast)
    }

    /// True when the dimension is the literal one, whether or not it carries
    /// the broadcast tag.
    pub fn is_one(&self) -> bool {
        match self {
            SizeExpr::Broadcast => true,
            SizeExpr::Poly(poly) => poly.as_constant() == Some(1),
        }
    }

    pub(crate) fn to_poly(&self) -> SizePoly {
        match self {
            SizeExpr::Broadcast => SizePoly::constant(1),
            SizeExpr::Poly(poly) => poly.clone(),
        }
    }

    pub fn can_eval(&self) -> bool {
        match self {
            SizeExpr::Broadcast => true,
            SizeExpr::Poly(poly) => poly.can_eval(),
        }
    }

    pub fn eval(&self) -> Result<u64, ShapeError> {
        match self {
            SizeExpr::Broadcast => Ok(1),
            SizeExpr::Poly(poly) => poly.eval(),
        }
    }

    /// Rewrites every symbol bound in `env`; the broadcast tag survives.
    pub fn subst(&self, env: &SymSizeEnv) -> SizeExpr {
        match self {
            SizeExpr::Broadcast => SizeExpr::Broadcast,
            SizeExpr::Poly(poly) => SizeExpr::Poly(poly.subst(env)),
        }
    }

    /// Semantic equality after substituting `env`: the broadcast tag counts
    /// as the literal one.
    pub fn equal_under(&self, other: &SizeExpr, env: &SymSizeEnv) -> bool {
        self.subst(env).to_poly() == other.subst(env).to_poly()
    }

    pub fn symbols(&self) -> BTreeSet<SizeSymbol> {
        match self {
            SizeExpr::Broadcast => BTreeSet::new(),
            SizeExpr::Poly(poly) => poly.symbols(),
        }
    }
}

impl Add for &SizeExpr {
    type Output = SizeExpr;

    fn add(self, rhs: &SizeExpr) -> SizeExpr {
        SizeExpr::Poly(self.to_poly().add(&rhs.to_poly()))
    }
}

impl Mul for &SizeExpr {
    type Output = SizeExpr;

    fn mul(self, rhs: &SizeExpr) -> SizeExpr {
        SizeExpr::Poly(self.to_poly().mul(&rhs.to_poly()))
    }
}

impl Sub for &SizeExpr {
    type Output = SizeExpr;

    /// Difference of sizes, e.g. the `N - 1` endpoint of a slice. The
    /// result only has to be a natural number once evaluated.
    fn sub(self, rhs: &SizeExpr) -> SizeExpr {
        SizeExpr::Poly(self.to_poly().sub(&rhs.to_poly()))
    }
}

impl Add for SizeExpr {
    type Output = SizeExpr;

    fn add(self, rhs: SizeExpr) -> SizeExpr {
        &self + &rhs
    }
}

impl Sub for SizeExpr {
    type Output = SizeExpr;

    fn sub(self, rhs: SizeExpr) -> SizeExpr {
        &self - &rhs
    }
}

impl Mul for SizeExpr {
    type Output = SizeExpr;

    fn mul(self, rhs: SizeExpr) -> SizeExpr {
        &self * &rhs
    }
}

impl fmt::Display for SizeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeExpr::Broadcast => f.write_str("B"),
            SizeExpr::Poly(poly) => poly.fmt(f),
        }
    }
}

/// Partial binding of size symbols to sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymSizeEnv {
    binds: BTreeMap<SizeSymbol, SizeExpr>,
}

impl SymSizeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a symbol to a concrete extent, consuming and returning the
    /// environment for chained construction.
    pub fn bind(mut self, name: impl Into<String>, value: u64) -> Self {
        self.binds
            .insert(SizeSymbol::new(name), SizeExpr::fixed(value));
        self
    }

    pub fn bind_size(mut self, name: impl Into<String>, size: SizeExpr) -> Self {
        self.binds.insert(SizeSymbol::new(name), size);
        self
    }

    pub fn get(&self, sym: &SizeSymbol) -> Option<&SizeExpr> {
        self.binds.get(sym)
    }

    pub fn is_empty(&self) -> bool {
        self.binds.is_empty()
    }
}
