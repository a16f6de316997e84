//! Minimization of sum-of-products formulas
//!
//! Each distinct variable gets a bit position (variables sorted by name) and each
//! term becomes an implicant with a value and a don't-care mask. Prime implicants
//! are generated from the terms themselves by iterated consensus: two implicants
//! that disagree on exactly one variable produce the implicant covering both halves,
//! and any implicant contained in another is absorbed. The terms are never expanded
//! into concrete minterms, so wide disjunctions of short terms stay cheap.
//!
//! The cover starts from every prime and drops primes that the remaining ones
//! already cover, trying the narrowest primes first. Containment is decided by
//! checking that the cover restricted to the prime is a tautology.
//!
//! Primes are kept in a canonical order (most don't-cares first, then by their
//! per-variable pattern). The set of primes depends only on the function, and
//! variables that do not affect the function are don't-cares in every prime, so
//! minimizing a minimized formula returns it unchanged.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use super::{BooleanFormula, BooleanTerm, BooleanVar};
use crate::constants::MAX_FORMULA_VARIABLES;
use crate::core::AggrError;

/// A product term over bit-indexed variables.
///
/// Bits set in `mask` are don't-cares; `value` is zero at those positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Implicant {
    value: u32,
    mask: u32,
}

impl Implicant {
    /// Whether every assignment satisfying `other` also satisfies `self`.
    const fn contains(self, other: Self) -> bool {
        self.mask & other.mask == other.mask && other.value & !self.mask == self.value
    }

    /// Variables asserted with opposite states by the two implicants.
    const fn opposition(self, other: Self) -> u32 {
        (self.value ^ other.value) & !self.mask & !other.mask
    }

    fn consensus(self, other: Self) -> Option<Self> {
        let opposed = self.opposition(other);
        if opposed.count_ones() != 1 {
            return None;
        }
        let mask = (self.mask & other.mask) | opposed;
        Some(Self {
            value: (self.value | other.value) & !mask,
            mask,
        })
    }

    /// Restriction to the assignments satisfying `by`, or `None` if they are disjoint.
    const fn cofactor(self, by: Self, all_bits: u32) -> Option<Self> {
        if self.opposition(by) != 0 {
            return None;
        }
        let mask = self.mask | (!by.mask & all_bits);
        Some(Self {
            value: self.value & !mask,
            mask,
        })
    }

    /// Per-variable pattern: 0, 1, or 2 for don't-care.
    fn pattern(self, width: usize) -> Vec<u8> {
        (0..width)
            .map(|bit| {
                let flag = 1u32 << bit;
                if self.mask & flag != 0 {
                    2
                } else if self.value & flag != 0 {
                    1
                } else {
                    0
                }
            })
            .collect()
    }
}

/// Minimize a disjunction of terms.
pub(crate) fn minimize(terms: &BTreeSet<BooleanTerm>) -> Result<BooleanFormula, AggrError> {
    let terms: Vec<&BooleanTerm> = terms.iter().filter(|t| !t.is_contradictory()).collect();
    if terms.is_empty() {
        return Ok(BooleanFormula::False);
    }

    let names: Vec<&str> = terms
        .iter()
        .flat_map(|t| t.vars().map(|v| v.name.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if names.len() > MAX_FORMULA_VARIABLES {
        return Err(AggrError::TooManyVariables {
            count: names.len(),
            max: MAX_FORMULA_VARIABLES,
        });
    }
    let width = names.len();
    let index: BTreeMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let all_bits = if width == 0 { 0 } else { u32::MAX >> (32 - width) };

    let implicants: Vec<Implicant> = terms
        .iter()
        .map(|term| {
            let mut implicant = Implicant {
                value: 0,
                mask: all_bits,
            };
            for var in term.vars() {
                let flag = 1u32 << index[var.name.as_str()];
                implicant.mask &= !flag;
                if var.state {
                    implicant.value |= flag;
                }
            }
            implicant
        })
        .collect();

    let mut primes = prime_implicants(&implicants);
    if primes.iter().any(|p| p.mask == all_bits) {
        return Ok(BooleanFormula::True);
    }
    primes.sort_by_cached_key(|p| (Reverse(p.mask.count_ones()), p.pattern(width)));
    let cover = select_cover(primes, all_bits);

    let mut result = BooleanFormula::False;
    for implicant in cover {
        let term: BooleanTerm = (0..width)
            .filter(|bit| implicant.mask & (1u32 << bit) == 0)
            .map(|bit| BooleanVar::new(names[bit], implicant.value & (1u32 << bit) != 0))
            .collect();
        if term.is_empty() {
            return Ok(BooleanFormula::True);
        }
        result.add_term(term);
    }
    Ok(result)
}

/// Add `candidate` unless an existing implicant contains it, dropping the ones it contains.
fn absorb(implicants: &mut Vec<Implicant>, candidate: Implicant) -> bool {
    if implicants.iter().any(|i| i.contains(candidate)) {
        return false;
    }
    implicants.retain(|i| !candidate.contains(*i));
    implicants.push(candidate);
    true
}

/// Every prime implicant of the disjunction of `terms`.
fn prime_implicants(terms: &[Implicant]) -> Vec<Implicant> {
    let mut primes = Vec::with_capacity(terms.len());
    for &term in terms {
        absorb(&mut primes, term);
    }

    loop {
        let mut found: Vec<Implicant> = Vec::new();
        for (i, a) in primes.iter().enumerate() {
            for b in &primes[i + 1..] {
                if let Some(combined) = a.consensus(*b)
                    && !primes.iter().any(|p| p.contains(combined))
                {
                    found.push(combined);
                }
            }
        }
        let mut changed = false;
        for combined in found {
            changed |= absorb(&mut primes, combined);
        }
        if !changed {
            return primes;
        }
    }
}

/// Whether the disjunction of `cubes` is true for every assignment.
fn is_tautology(cubes: &[Implicant], all_bits: u32) -> bool {
    if cubes.iter().any(|c| c.mask == all_bits) {
        return true;
    }

    // split on the variable asserted in both states by the most cubes
    let mut split: Option<(u32, usize)> = None;
    for bit in 0..u32::BITS {
        let flag = 1u32 << bit;
        if all_bits & flag == 0 {
            continue;
        }
        let (mut ones, mut zeros) = (0usize, 0usize);
        for cube in cubes.iter().filter(|c| c.mask & flag == 0) {
            if cube.value & flag == 0 {
                zeros += 1;
            } else {
                ones += 1;
            }
        }
        if ones > 0 && zeros > 0 && split.is_none_or(|(_, count)| ones + zeros > count) {
            split = Some((flag, ones + zeros));
        }
    }

    // a unate cover is a tautology only if it holds the universal cube
    let Some((flag, _)) = split else {
        return false;
    };
    [0, flag].into_iter().all(|value| {
        let half = Implicant {
            value,
            mask: all_bits & !flag,
        };
        let restricted: Vec<Implicant> = cubes
            .iter()
            .filter_map(|c| c.cofactor(half, all_bits))
            .collect();
        is_tautology(&restricted, all_bits)
    })
}

/// Whether `prime` is contained in the disjunction of `others`.
fn is_covered<'a>(prime: Implicant, others: impl Iterator<Item = &'a Implicant>, all_bits: u32) -> bool {
    let restricted: Vec<Implicant> = others
        .filter_map(|o| o.cofactor(prime, all_bits))
        .collect();
    is_tautology(&restricted, all_bits)
}

/// Drop primes covered by the rest, narrowest first.
///
/// `primes` must already be in canonical order.
fn select_cover(primes: Vec<Implicant>, all_bits: u32) -> Vec<Implicant> {
    let mut kept = vec![true; primes.len()];
    for i in (0..primes.len()).rev() {
        kept[i] = false;
        let others = primes
            .iter()
            .zip(&kept)
            .filter_map(|(p, keep)| keep.then_some(p));
        if !is_covered(primes[i], others, all_bits) {
            kept[i] = true;
        }
    }
    primes
        .into_iter()
        .zip(kept)
        .filter_map(|(p, keep)| keep.then_some(p))
        .collect()
}
