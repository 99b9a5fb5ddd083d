use crate::op::MmiOp;

fn lanes32(v: u128) -> [u32; 4] {
    [v as u32, (v >> 32) as u32, (v >> 64) as u32, (v >> 96) as u32]
}

fn join32(l: [u32; 4]) -> u128 {
    l.iter()
        .enumerate()
        .fold(0u128, |acc, (i, &x)| acc | ((x as u128) << (32 * i)))
}

fn lanes16(v: u128) -> [u16; 8] {
    let mut out = [0u16; 8];
    for (i, lane) in out.iter_mut().enumerate() {
        *lane = (v >> (16 * i)) as u16;
    }
    out
}

fn join16(l: [u16; 8]) -> u128 {
    l.iter()
        .enumerate()
        .fold(0u128, |acc, (i, &x)| acc | ((x as u128) << (16 * i)))
}

fn map32(a: u128, b: u128, f: impl Fn(u32, u32) -> u32) -> u128 {
    let (a, b) = (lanes32(a), lanes32(b));
    join32([f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])])
}

fn map16(a: u128, b: u128, f: impl Fn(u16, u16) -> u16) -> u128 {
    let (a, b) = (lanes16(a), lanes16(b));
    let mut out = [0u16; 8];
    for i in 0..8 {
        out[i] = f(a[i], b[i]);
    }
    join16(out)
}

/// Evaluate a multimedia instruction over full 128-bit operands:
/// `rd = op(rs, rt)`.
pub fn eval(op: MmiOp, rs: u128, rt: u128) -> u128 {
    match op {
        MmiOp::Paddw => map32(rs, rt, u32::wrapping_add),
        MmiOp::Psubw => map32(rs, rt, u32::wrapping_sub),
        MmiOp::Paddh => map16(rs, rt, u16::wrapping_add),
        MmiOp::Psubh => map16(rs, rt, u16::wrapping_sub),
        MmiOp::Paddsw => map32(rs, rt, |a, b| (a as i32).saturating_add(b as i32) as u32),
        MmiOp::Psubsw => map32(rs, rt, |a, b| (a as i32).saturating_sub(b as i32) as u32),
        MmiOp::Paddsh => map16(rs, rt, |a, b| (a as i16).saturating_add(b as i16) as u16),
        MmiOp::Psubsh => map16(rs, rt, |a, b| (a as i16).saturating_sub(b as i16) as u16),
        MmiOp::Padduw => map32(rs, rt, u32::saturating_add),
        MmiOp::Psubuw => map32(rs, rt, u32::saturating_sub),
        MmiOp::Pand => rs & rt,
        MmiOp::Pxor => rs ^ rt,
        MmiOp::Por => rs | rt,
        MmiOp::Pnor => !(rs | rt),
    }
}
