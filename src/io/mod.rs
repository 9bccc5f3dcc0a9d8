mod file_reader;
mod range_reader;

pub use file_reader::{FileHandlePool, FileRangeReader, DEFAULT_OPEN_FILE_LIMIT};
pub use range_reader::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, write_u16_be, write_u16_le, write_u32_be,
    write_u32_le, MemoryRangeReader, RangeReader,
};
