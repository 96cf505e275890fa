pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

/// Size of a block device sector in bytes.
pub const SECTOR_SIZE: u32 = 512;
