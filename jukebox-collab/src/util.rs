use rand::{distributions::Alphanumeric, seq::SliceRandom, thread_rng, Rng};

/// The glyphs room codes are drawn from. I, O, 0 and 1 are excluded because
/// they are easy to misread when a code is shared out loud or on a screen.
pub const ROOM_CODE_ALPHABET: [char; 32] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z', '2', '3', '4', '5', '6', '7', '8', '9',
];

pub const ROOM_CODE_LENGTH: usize = 6;

pub fn random_string(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}

/// Generates a human-shareable room code
pub fn room_code() -> String {
    let mut rng = thread_rng();

    (0..ROOM_CODE_LENGTH)
        .map(|_| {
            *ROOM_CODE_ALPHABET
                .choose(&mut rng)
                .expect("alphabet is not empty")
        })
        .collect()
}
