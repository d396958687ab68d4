//! The byte-mutation capability and its stock implementation.

use std::fmt;

use libafl_bolts::rands::{Rand, StdRand};

/// Low-level byte mutation, consumed by the input preparer. Implementations
/// edit the buffer in place; only [`Mutator::resize`] and
/// [`Mutator::post_mangle`] may change its length.
pub trait Mutator: Send + Sync + fmt::Debug {
    /// Possibly pick a new length in `[1, max_sz]`.
    fn resize(&self, rand: &mut StdRand, buf: &mut Vec<u8>, max_sz: usize);

    /// Apply roughly `len * flip_rate` in-place edits.
    fn mangle(&self, rand: &mut StdRand, buf: &mut [u8], flip_rate: f64, dictionary: &[Vec<u8>]);

    /// Final length-changing pass, applied after `mangle` in static mode and
    /// to seeds handed to an external mutator.
    fn post_mangle(&self, _rand: &mut StdRand, _buf: &mut Vec<u8>) {}
}

/// Stock mutator: occasional random resize plus a mix of bit flips, byte
/// stores, arithmetic nudges, swaps and dictionary splices.
#[derive(Debug, Default, Clone)]
pub struct StdMutator;

/// How often `resize` picks a fresh length.
const RESIZE_PROB: f64 = 0.1;

impl Mutator for StdMutator {
    fn resize(&self, rand: &mut StdRand, buf: &mut Vec<u8>, max_sz: usize) {
        if max_sz == 0 {
            return;
        }
        if buf.is_empty() {
            buf.push(0);
        }
        if rand.coinflip(RESIZE_PROB) {
            let new_len = rand.between(1, max_sz);
            buf.resize(new_len, 0);
        } else if buf.len() > max_sz {
            buf.truncate(max_sz);
        }
    }

    fn mangle(&self, rand: &mut StdRand, buf: &mut [u8], flip_rate: f64, dictionary: &[Vec<u8>]) {
        if buf.is_empty() {
            return;
        }
        let len = buf.len();
        let changes = ((len as f64 * flip_rate) as usize).max(1);
        for _ in 0..changes {
            let offset = rand.between(0, len - 1);
            match rand.between(0, 5) {
                0 => buf[offset] ^= 1 << rand.between(0, 7),
                1 => buf[offset] = rand.next() as u8,
                2 => buf[offset] = buf[offset].wrapping_add(1),
                3 => buf[offset] = buf[offset].wrapping_sub(1),
                4 => {
                    let other = rand.between(0, len - 1);
                    buf.swap(offset, other);
                }
                _ => match rand.choose(dictionary.iter()) {
                    Some(token) => {
                        let n = token.len().min(len - offset);
                        buf[offset..offset + n].copy_from_slice(&token[..n]);
                    }
                    None => buf[offset] = rand.next() as u8,
                },
            }
        }
    }
}
