//! Entity identifiers derived from entity names.

const FNV1_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV1_PRIME: u32 = 0x0100_0193;

/// Returns the object id ESPHome derives from an entity name.
///
/// Spaces become underscores, ASCII letters are lowercased and anything outside
/// `[a-z0-9_-]` is replaced by an underscore.
pub fn object_id(name: &str) -> String {
    name.chars().map(normalize).collect()
}

/// Computes the 32-bit entity key ESPHome uses on the wire (FNV-1 over the object id).
pub fn entity_key(name: &str) -> u32 {
    name.chars().map(normalize).fold(FNV1_OFFSET_BASIS, |hash, c| {
        // `normalize` only ever yields ASCII.
        hash.wrapping_mul(FNV1_PRIME) ^ u32::from(c)
    })
}

fn normalize(c: char) -> char {
    let c = if c == ' ' { '_' } else { c.to_ascii_lowercase() };

    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
        c
    } else {
        '_'
    }
}
