use super::sext32;

/// MULT: signed 32x32 product. Returns `(lo, hi)`, each the
/// sign-extended half of the 64-bit product.
pub fn mult(rs: u64, rt: u64) -> (u64, u64) {
    let p = (rs as u32 as i32 as i64).wrapping_mul(rt as u32 as i32 as i64) as u64;
    (sext32(p), sext32(p >> 32))
}

/// MULTU: unsigned 32x32 product.
pub fn multu(rs: u64, rt: u64) -> (u64, u64) {
    let p = (rs as u32 as u64) * (rt as u32 as u64);
    (sext32(p), sext32(p >> 32))
}

/// DIV with the R5900 results for the cases that trap or are
/// undefined elsewhere. Returns `(lo, hi)`.
pub fn div(rs: u64, rt: u64) -> (u64, u64) {
    let n = rs as u32 as i32;
    let d = rt as u32 as i32;
    let (q, r) = if n == i32::MIN && d == -1 {
        (i32::MIN, 0)
    } else if d == 0 {
        (if n < 0 { 1 } else { -1 }, n)
    } else {
        (n / d, n % d)
    };
    (q as i64 as u64, r as i64 as u64)
}

/// DIVU; division by zero yields LO = -1, HI = rs.
pub fn divu(rs: u64, rt: u64) -> (u64, u64) {
    let n = rs as u32;
    let d = rt as u32;
    let (q, r) = if d == 0 { (u32::MAX, n) } else { (n / d, n % d) };
    (sext32(q as u64), sext32(r as u64))
}

/// Pack `(lo, hi)` words into one value for a helper return:
/// low word in bits 0..32, high word in bits 32..64.
#[inline]
pub fn pack(lo: u64, hi: u64) -> u64 {
    (lo as u32 as u64) | ((hi as u32 as u64) << 32)
}
