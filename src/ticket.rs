//! Request cost tickets
//!
//! A ticket is the two-dimensional cost of a single request: a `weight`
//! (IOPS pressure) and a `size` (bandwidth pressure). A request of weight 1
//! and size 16384 admitted once per second costs the device 1 IOPS and
//! 16 kB/s of bandwidth.
//!
//! Read/write cost multipliers are applied by the caller before the ticket
//! is built; the scheduler never interprets operation kinds.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Two-dimensional cost of a request passing through the scheduler.
///
/// Arithmetic is component-wise. There is no total order between tickets;
/// only equality is defined. To rank tickets, project them onto a scalar
/// axis with [`normalize`](Ticket::normalize).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ticket {
    weight: u32,
    size: u32,
}

impl Ticket {
    /// Create a ticket with the given weight and size.
    pub const fn new(weight: u32, size: u32) -> Self {
        Self { weight, size }
    }

    /// The weight (IOPS) component.
    pub const fn weight(&self) -> u32 {
        self.weight
    }

    /// The size (bandwidth) component.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// True if both components are zero.
    pub const fn is_empty(&self) -> bool {
        self.weight == 0 && self.size == 0
    }

    /// True if both components are non-zero.
    ///
    /// A valid normalization axis must satisfy this; a request ticket need
    /// not (a pure-sync request may carry zero size, for example).
    pub const fn is_non_zero(&self) -> bool {
        self.weight > 0 && self.size > 0
    }

    /// Project this ticket onto a scalar along the given base axis:
    /// `weight / axis.weight + size / axis.size`.
    ///
    /// The relative importance of the two dimensions follows from which
    /// denominator is relatively higher. A zero component in `self` is
    /// legal and simply contributes nothing; a zero component in `axis` is
    /// a contract violation.
    pub fn normalize(&self, axis: Ticket) -> f32 {
        assert!(
            axis.is_non_zero(),
            "normalization axis {axis} must be non-zero in both dimensions"
        );
        self.weight as f32 / axis.weight as f32 + self.size as f32 / axis.size as f32
    }

    /// Component-wise `max(self - other, 0)`.
    ///
    /// For each dimension, returns how far `self` is ahead of `other`, or
    /// zero if it is behind.
    pub fn wrapping_difference(&self, other: Ticket) -> Ticket {
        Ticket {
            weight: self.weight.saturating_sub(other.weight),
            size: self.size.saturating_sub(other.size),
        }
    }
}

impl Add for Ticket {
    type Output = Ticket;

    fn add(self, rhs: Ticket) -> Ticket {
        Ticket {
            weight: self.weight + rhs.weight,
            size: self.size + rhs.size,
        }
    }
}

impl AddAssign for Ticket {
    fn add_assign(&mut self, rhs: Ticket) {
        self.weight += rhs.weight;
        self.size += rhs.size;
    }
}

impl Sub for Ticket {
    type Output = Ticket;

    fn sub(self, rhs: Ticket) -> Ticket {
        Ticket {
            weight: self.weight - rhs.weight,
            size: self.size - rhs.size,
        }
    }
}

impl SubAssign for Ticket {
    fn sub_assign(&mut self, rhs: Ticket) {
        self.weight -= rhs.weight;
        self.size -= rhs.size;
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.weight, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_ticket_algebra() {
        let a = Ticket::new(3, 4096);
        let b = Ticket::new(1, 512);

        assert_eq!(a + b, Ticket::new(4, 4608));
        assert_eq!((a + b) - b, a);

        let mut acc = Ticket::default();
        acc += a;
        acc += b;
        acc -= b;
        assert_eq!(acc, a);
    }

    #[test]
    fn test_ticket_algebra_randomized() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let a = Ticket::new(rng.gen_range(0..1 << 16), rng.gen_range(0..1 << 20));
            let b = Ticket::new(rng.gen_range(0..1 << 16), rng.gen_range(0..1 << 20));
            assert_eq!((a + b) - b, a, "(a + b) - b != a for a={a}, b={b}");

            let d = a.wrapping_difference(b);
            assert_eq!(d.weight(), a.weight().saturating_sub(b.weight()));
            assert_eq!(d.size(), a.size().saturating_sub(b.size()));
        }
    }

    #[test]
    fn test_normalize() {
        let axis = Ticket::new(10, 1000);
        let t = Ticket::new(5, 250);
        let n = t.normalize(axis);
        assert!((n - 0.75).abs() < 1e-6, "normalized value was {n}");

        // A zero numerator component only drops that dimension.
        let weight_only = Ticket::new(10, 0);
        assert!((weight_only.normalize(axis) - 1.0).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "normalization axis")]
    fn test_normalize_zero_axis() {
        Ticket::new(1, 1).normalize(Ticket::new(10, 0));
    }

    #[test]
    fn test_wrapping_difference_clamps_to_zero() {
        let a = Ticket::new(2, 100);
        let b = Ticket::new(5, 40);
        assert_eq!(a.wrapping_difference(b), Ticket::new(0, 60));
        assert_eq!(b.wrapping_difference(a), Ticket::new(3, 0));
    }

    #[test]
    fn test_emptiness() {
        assert!(Ticket::default().is_empty());
        assert!(!Ticket::new(0, 1).is_empty());
        assert!(!Ticket::new(0, 1).is_non_zero());
        assert!(Ticket::new(1, 1).is_non_zero());
    }
}
