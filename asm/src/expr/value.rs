use crate::error::{AsmError, AsmResult};
use crate::pos::FilePos;

/// Supplies the pieces of state an [`super::Expr`] needs to resolve names,
/// anonymous labels, struct members and debug memory reads. Implemented by
/// the symbol scope stack during assembly; tests can stub it out.
pub trait EvalContext {
    /// `None` means the identifier is not yet known (a legitimate forward
    /// reference); the caller registers a pending write and retries later.
    fn resolve_ident(&mut self, name: &str) -> Option<i64>;
    fn resolve_anonymous(&mut self, forward: bool, count: u32) -> Option<i64>;
    fn resolve_member(&mut self, base: i64, member: &str, pos: &FilePos) -> Option<i64>;
    fn read_memory(&mut self, addr: i64, width: u32, pos: &FilePos) -> AsmResult<i64>;
    /// `_arm`/`_base`/`_bytes`/`_here`/`_main`/`_pc`/`_thumb`/`_version`.
    /// Unlike `resolve_ident` these always resolve immediately; there is no
    /// forward-reference case for a query about the current context.
    fn resolve_reserved(&mut self, name: &str, pos: &FilePos) -> AsmResult<i64> {
        Err(AsmError::DirectiveError {
            pos: pos.clone(),
            message: format!("`{name}` is not available in this evaluation context"),
        })
    }
    /// User `.def NAME(params)=expr` templates take priority over the
    /// builtin functions. `Ok(None)` means `name` is not a known template,
    /// so the caller should fall back to [`call_builtin`].
    fn resolve_macro(&mut self, name: &str, args: &[i64], pos: &FilePos) -> AsmResult<Option<i64>> {
        let _ = (name, args, pos);
        Ok(None)
    }
}

/// Named functions available inside expressions: `abs`, `clamp`, `log2`,
/// `log2assert`, `max`, `min`, `nrt`, `pow`, `rgb`, `sign`, `sqrt`.
pub fn call_builtin(name: &str, args: &[i64], pos: &FilePos) -> AsmResult<i64> {
    let arity_err = |expected: usize| AsmError::ArityMismatch {
        pos: pos.clone(),
        name: name.to_string(),
        expected,
        found: args.len(),
    };

    match name {
        "abs" => {
            let [a] = args else { return Err(arity_err(1)) };
            Ok(a.wrapping_abs())
        }
        "sign" => {
            let [a] = args else { return Err(arity_err(1)) };
            Ok(a.signum())
        }
        "min" => {
            let [a, b] = args else { return Err(arity_err(2)) };
            Ok(*a.min(b))
        }
        "max" => {
            let [a, b] = args else { return Err(arity_err(2)) };
            Ok(*a.max(b))
        }
        "clamp" => {
            let [v, lo, hi] = args else { return Err(arity_err(3)) };
            Ok((*v).clamp(*lo, *hi))
        }
        "sqrt" => {
            let [a] = args else { return Err(arity_err(1)) };
            if *a < 0 {
                return Err(AsmError::NegativeSqrt { pos: pos.clone(), value: *a });
            }
            Ok(isqrt(*a))
        }
        "nrt" => {
            let [a, n] = args else { return Err(arity_err(2)) };
            Ok(inrt(*a, *n))
        }
        "pow" => {
            let [base, exp] = args else { return Err(arity_err(2)) };
            Ok(ipow(*base, *exp))
        }
        "log2" => {
            let [a] = args else { return Err(arity_err(1)) };
            Ok(ilog2(*a, pos)?)
        }
        "log2assert" => {
            let [a] = args else { return Err(arity_err(1)) };
            let bits = u64::try_from(*a).unwrap_or(0);
            if *a <= 0 || !bits.is_power_of_two() {
                return Err(AsmError::Log2Assert { pos: pos.clone(), value: *a });
            }
            Ok(ilog2(*a, pos)?)
        }
        "rgb" => {
            let [r, g, b] = args else { return Err(arity_err(3)) };
            let r = (*r) & 0x1F;
            let g = (*g) & 0x1F;
            let b = (*b) & 0x1F;
            Ok(r | (g << 5) | (b << 10))
        }
        _ => Err(AsmError::UnknownFunction { pos: pos.clone(), name: name.to_string() }),
    }
}

fn isqrt(n: i64) -> i64 {
    if n < 2 {
        return n;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

fn inrt(a: i64, n: i64) -> i64 {
    if n == 0 {
        return 1;
    }
    if a == 0 {
        return 0;
    }
    let negative = a < 0 && n % 2 != 0;
    let a = a.unsigned_abs();
    let mut lo: u64 = 0;
    let mut hi: u64 = a;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if ipow_u64(mid, n.unsigned_abs()) <= a {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let result = i64::try_from(lo).unwrap_or(i64::MAX);
    if negative { -result } else { result }
}

fn ipow_u64(base: u64, exp: u64) -> u64 {
    let mut result: u64 = 1;
    for _ in 0..exp {
        result = result.saturating_mul(base);
    }
    result
}

fn ipow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return if base.abs() == 1 { base.pow((-exp) as u32 % 2) } else { 0 };
    }
    base.wrapping_pow(exp as u32)
}

fn ilog2(n: i64, pos: &FilePos) -> AsmResult<i64> {
    if n <= 0 {
        return Err(AsmError::Log2Assert { pos: pos.clone(), value: n });
    }
    Ok(i64::from(63 - n.leading_zeros()))
}
