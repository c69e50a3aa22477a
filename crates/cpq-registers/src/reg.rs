//! Register value abstraction.

/// A typed register value that round-trips through its raw width.
pub trait Register: Copy {
    type Regwidth;

    fn from_raw(val: Self::Regwidth) -> Self;

    fn to_raw(self) -> Self::Regwidth;
}
