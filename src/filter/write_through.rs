//! filter/write_through - батч страниц пишется как есть.

use anyhow::Result;

use crate::datasink::DsFile;
use crate::source::PageBatch;

pub struct WriteThrough;

impl WriteThrough {
    pub fn process(&mut self, batch: &PageBatch<'_>, out: &mut dyn DsFile) -> Result<()> {
        out.write(batch.data)
    }
}
