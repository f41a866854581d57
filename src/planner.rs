use crate::error::PlanError;
use crate::register::RegisterSpec;

use std::cmp::Reverse;

/// Largest register count a single Modbus read may request.
pub const MODBUS_MAX_READ: u16 = 125;
/// Block size used when the configuration does not say otherwise.
pub const DEFAULT_MAX_BLOCK_SIZE: u16 = 123;

/// One contiguous read `[start, start + count)` and the registers it serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
    pub registers: Vec<RegisterSpec>,
}

impl ReadBlock {
    fn open(spec: &RegisterSpec) -> Self {
        Self {
            start: spec.address,
            count: spec.width,
            registers: vec![spec.clone()],
        }
    }

    /// One past the last address covered.
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }
}

pub struct RegisterPlanner;

impl RegisterPlanner {
    /// Group `registers` into the fewest contiguous reads of at most
    /// `max_block_size` words each.
    ///
    /// Greedy sweep in address order: a register joins the open block while
    /// the block's span including it stays within `max_block_size`,
    /// otherwise the block is closed and a new one starts at the register.
    /// The result only depends on the input set, so it can be cached.
    pub fn plan(registers: &[RegisterSpec], max_block_size: u16) -> Result<Vec<ReadBlock>, PlanError> {
        if max_block_size == 0 {
            return Err(PlanError::ZeroBlockSize);
        }

        let mut sorted: Vec<&RegisterSpec> = registers.iter().collect();
        // wider first at equal addresses so narrower aliases land in the same block
        sorted.sort_by_key(|r| (r.address, Reverse(r.width)));

        let mut blocks: Vec<ReadBlock> = Vec::new();
        for spec in sorted {
            if spec.width > max_block_size {
                return Err(PlanError::WiderThanBlock {
                    name: spec.name.clone(),
                    width: spec.width,
                    max: max_block_size,
                });
            }
            if spec.end() > 0x1_0000 {
                return Err(PlanError::AddressOverflow {
                    name: spec.name.clone(),
                    address: spec.address,
                });
            }

            match blocks.last_mut() {
                Some(block) if spec.end() - u32::from(block.start) <= u32::from(max_block_size) => {
                    let end = block.end().max(spec.end());
                    block.count = (end - u32::from(block.start)) as u16;
                    block.registers.push(spec.clone());
                }
                Some(block) if u32::from(spec.address) < block.end() => {
                    return Err(PlanError::Straddles {
                        name: spec.name.clone(),
                    });
                }
                _ => blocks.push(ReadBlock::open(spec)),
            }
        }

        Ok(blocks)
    }
}
