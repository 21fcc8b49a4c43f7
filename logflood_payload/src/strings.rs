//! Code for the quick creation of random strings

use rand::Rng;

/// Every printable ASCII character, space included.
pub(crate) const PRINTABLE: &[u8] =
    b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// A pool of random characters
///
/// Log lines are slices of `inner` taken at a random offset, so producing a
/// line of `n` bytes costs one RNG call rather than `n`. The pool grows when a
/// slice longer than itself is requested.
#[derive(Debug, Clone)]
pub(crate) struct RandomStringPool {
    inner: String,
    alphabet: &'static [u8],
}

impl RandomStringPool {
    /// Create a pool of `bytes` characters drawn from `alphabet`.
    ///
    /// User should supply a non-empty alphabet of ASCII characters.
    pub(crate) fn with_size_and_alphabet<R>(
        rng: &mut R,
        bytes: usize,
        alphabet: &'static [u8],
    ) -> Self
    where
        R: Rng + ?Sized,
    {
        let mut pool = Self {
            inner: String::new(),
            alphabet,
        };
        pool.extend(rng, bytes);
        pool
    }

    /// Create a pool of `bytes` printable ASCII characters.
    pub(crate) fn with_size<R>(rng: &mut R, bytes: usize) -> Self
    where
        R: Rng + ?Sized,
    {
        Self::with_size_and_alphabet(rng, bytes, PRINTABLE)
    }

    fn extend<R>(&mut self, rng: &mut R, bytes: usize)
    where
        R: Rng + ?Sized,
    {
        if self.alphabet.is_empty() {
            return;
        }
        self.inner.reserve(bytes);
        for _ in 0..bytes {
            let idx = rng.random_range(0..self.alphabet.len());
            self.inner.push(char::from(self.alphabet[idx]));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    /// Grow the pool until it holds at least `bytes` characters, at least
    /// doubling each time it grows.
    pub(crate) fn reserve<R>(&mut self, rng: &mut R, bytes: usize)
    where
        R: Rng + ?Sized,
    {
        let len = self.inner.len();
        if bytes > len {
            let target = bytes.max(len.saturating_mul(2));
            self.extend(rng, target - len);
        }
    }

    /// Return a `&str` from the interior storage with size `bytes`. Result will
    /// be `None` if the request cannot be satisfied.
    pub(crate) fn of_size<'a, R>(&'a self, rng: &mut R, bytes: usize) -> Option<&'a str>
    where
        R: Rng + ?Sized,
    {
        if bytes > self.inner.len() {
            return None;
        }
        let max_lower_idx = self.inner.len() - bytes;
        let lower_idx = rng.random_range(0..=max_lower_idx);
        self.inner.get(lower_idx..lower_idx + bytes)
    }
}
