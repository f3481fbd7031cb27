/// A Stellaris part as identified by the boot loader's INFO reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub number: u16,
    pub name: &'static str,
}

const fn part(id: u8, number: u16, name: &'static str) -> (u8, Part) {
    (id, Part { number, name })
}

// Part number field of DID1, in the order the boot loader documents them.
// Several parts share an ID; the first entry wins.
static PARTS: &[(u8, Part)] = &[
    part(0x44, 0x3739, "lm3s3739"),
    part(0x49, 0x3748, "lm3s3748"),
    part(0x45, 0x3749, "lm3s3749"),
    part(0x81, 0x5632, "lm3s5632"),
    part(0x96, 0x5732, "lm3s5732"),
    part(0x97, 0x5737, "lm3s5737"),
    part(0xA0, 0x5739, "lm3s5739"),
    part(0x99, 0x5747, "lm3s5747"),
    part(0xA7, 0x5749, "lm3s5749"),
    part(0x41, 0x3026, "lm3s3j26"),
    part(0x40, 0x3026, "lm3s3n26"),
    part(0x3F, 0x3026, "lm3s3w26"),
    part(0x3E, 0x3026, "lm3s3z26"),
    part(0x09, 0x5031, "lm3s5k31"),
    part(0x4A, 0x5036, "lm3s5k36"),
    part(0x0A, 0x5031, "lm3s5p31"),
    part(0x48, 0x5036, "lm3s5p36"),
    part(0x07, 0x5031, "lm3s5r31"),
    part(0x4B, 0x5036, "lm3s5r36"),
    part(0x47, 0x5036, "lm3s5t36"),
    part(0x46, 0x5036, "lm3s5y36"),
    part(0x41, 0x3826, "lm3s3826"),
    part(0x43, 0x3651, "lm3s3651"),
    part(0x46, 0x3759, "lm3s3759"),
    part(0x48, 0x3768, "lm3s3768"),
    part(0x8A, 0x5652, "lm3s5652"),
    part(0x91, 0x5662, "lm3s5662"),
    part(0x9A, 0x5752, "lm3s5752"),
    part(0x9B, 0x5757, "lm3s5757"),
    part(0x9C, 0x5762, "lm3s5762"),
    part(0x9D, 0x5767, "lm3s5767"),
    part(0xA8, 0x5769, "lm3s5769"),
    part(0xA9, 0x5768, "lm3s5768"),
    part(0x68, 0x5091, "lm3s5b91"),
    part(0x0D, 0x5051, "lm3s5p51"),
    part(0x4C, 0x5056, "lm3s5p56"),
    part(0x66, 0x9090, "lm3s9b90"),
    part(0x6A, 0x9092, "lm3s9b92"),
    part(0x6E, 0x9095, "lm3s9b95"),
    part(0x6F, 0x9096, "lm3s9b96"),
    part(0x4D, 0x5656, "lm3s5656"),
    part(0x69, 0x5791, "lm3s5791"),
    part(0x0B, 0x5951, "lm3s5951"),
    part(0x4E, 0x5956, "lm3s5956"),
];

pub fn lookup_part(id: u8) -> Option<Part> {
    PARTS.iter().find(|(pid, _)| *pid == id).map(|(_, part)| *part)
}

/// Format a silicon revision the way TI prints it, e.g. "A2" or "C1".
pub fn revision_string(major: u8, minor: u8) -> String {
    format!("{}{}", b'A'.wrapping_add(major) as char, b'0'.wrapping_add(minor) as char)
}
