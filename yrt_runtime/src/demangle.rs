//! Ymir symbol names: `_Y` followed by length-prefixed path segments, then
//! `F` for functions and the mangled signature, e.g.
//! `_Y4core5array10OutOfArray4selfFxP...` for `core::array::OutOfArray::self (...)`.

use std::borrow::Cow;

fn read_len(bytes: &[u8], pos: &mut usize) -> usize {
    let mut len = 0usize;
    while let Some(digit) = bytes.get(*pos).filter(|b| b.is_ascii_digit()) {
        len = len.saturating_mul(10).saturating_add((digit - b'0') as usize);
        *pos += 1;
    }
    len
}

/// Demangles `symbol`; anything that is not a Ymir symbol comes back as-is.
pub fn demangle(symbol: &[u8]) -> Cow<'_, str> {
    if symbol.len() <= 2 || !symbol.starts_with(b"_Y") {
        return String::from_utf8_lossy(symbol);
    }

    let mut out = String::new();
    let mut pos = 2;
    loop {
        let len = read_len(symbol, &mut pos);
        if len == 0 {
            break;
        }
        let end = (pos + len).min(symbol.len());
        if !out.is_empty() {
            out.push_str("::");
        }
        out.push_str(&String::from_utf8_lossy(&symbol[pos..end]));
        pos = end;
    }

    if symbol.get(pos) == Some(&b'F') {
        out.push_str(" (...)");
    }
    Cow::Owned(out)
}

/// `a::bc` becomes `1a2bc`.
pub fn mangle_path(path: &str) -> String {
    path.split("::")
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("{}{}", segment.len(), segment))
        .collect()
}
