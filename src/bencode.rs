//! Minimal bencode support: enough to build KRPC messages and to pull
//! fields out of an info dict without materializing a value tree.
//!
//! Decoding works on borrowed slices. `dict_find` walks the top-level
//! entries of a dict and returns the raw slice of a value; the typed
//! getters interpret that slice.

/// Raw slice of the value stored under `key`, if the dict has it.
fn dict_find<'a>(raw: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let mut c = Cursor::new(raw);
    c.expect(b'd')?;
    while c.peek()? != b'e' {
        let k = c.parse_bytes()?;
        let start = c.pos;
        c.skip_value()?;
        if k == key {
            return raw.get(start..c.pos);
        }
    }
    None
}

pub fn dict_get_bytes<'a>(raw: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let v = dict_find(raw, key)?;
    Cursor::new(v).parse_bytes()
}

pub fn dict_get_str<'a>(raw: &'a [u8], key: &[u8]) -> Option<&'a str> {
    std::str::from_utf8(dict_get_bytes(raw, key)?).ok()
}

pub fn dict_get_int(raw: &[u8], key: &[u8]) -> Option<i64> {
    let v = dict_find(raw, key)?;
    let mut c = Cursor::new(v);
    c.expect(b'i')?;
    let neg = if c.peek()? == b'-' {
        c.pos += 1;
        true
    } else {
        false
    };
    let mut n: i64 = 0;
    let mut saw = false;
    while let Some(b) = c.peek() {
        if !b.is_ascii_digit() {
            break;
        }
        saw = true;
        n = n.checked_mul(10)?.checked_add((b - b'0') as i64)?;
        c.pos += 1;
    }
    if !saw || c.peek()? != b'e' {
        return None;
    }
    Some(if neg { -n } else { n })
}

/// Nested dict under `key`, as its raw slice (usable with the getters again).
pub fn dict_get_dict<'a>(raw: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let v = dict_find(raw, key)?;
    if v.first() == Some(&b'd') { Some(v) } else { None }
}

/// Elements of the list under `key`, each as its raw slice.
pub fn dict_get_list<'a>(raw: &'a [u8], key: &[u8]) -> Option<Vec<&'a [u8]>> {
    let v = dict_find(raw, key)?;
    let mut c = Cursor::new(v);
    c.expect(b'l')?;
    let mut out = Vec::new();
    while c.peek()? != b'e' {
        let start = c.pos;
        c.skip_value()?;
        out.push(v.get(start..c.pos)?);
    }
    Some(out)
}

/// Interpret a raw element slice as a bytestring.
pub fn as_bytes(raw: &[u8]) -> Option<&[u8]> {
    Cursor::new(raw).parse_bytes()
}

// ---- encoding ----

pub fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

// Nesting deeper than this is no real torrent; skipping is recursive, so
// the walk must refuse before attacker-controlled input can exhaust the
// stack.
const MAX_SKIP_DEPTH: usize = 64;

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.raw.get(self.pos).copied()
    }

    fn expect(&mut self, b: u8) -> Option<()> {
        if self.peek()? != b {
            return None;
        }
        self.pos += 1;
        Some(())
    }

    fn parse_usize(&mut self) -> Option<usize> {
        let mut n: usize = 0;
        let mut saw = false;
        while let Some(b) = self.peek() {
            if !b.is_ascii_digit() {
                break;
            }
            saw = true;
            n = n.checked_mul(10)?.checked_add((b - b'0') as usize)?;
            self.pos += 1;
        }
        if saw { Some(n) } else { None }
    }

    fn parse_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.parse_usize()?;
        self.expect(b':')?;
        let start = self.pos;
        let end = start.checked_add(len)?;
        let out = self.raw.get(start..end)?;
        self.pos = end;
        Some(out)
    }

    fn skip_value(&mut self) -> Option<()> {
        self.skip_value_at(0)
    }

    fn skip_value_at(&mut self, depth: usize) -> Option<()> {
        if depth >= MAX_SKIP_DEPTH {
            return None;
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.pos += 1;
                }
                self.pos += 1;
                Some(())
            }
            b'l' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_value_at(depth + 1)?;
                }
                self.pos += 1;
                Some(())
            }
            b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.parse_bytes()?;
                    self.skip_value_at(depth + 1)?;
                }
                self.pos += 1;
                Some(())
            }
            b'0'..=b'9' => {
                self.parse_bytes()?;
                Some(())
            }
            _ => None,
        }
    }
}
