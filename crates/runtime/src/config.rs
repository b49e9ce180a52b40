//! Runtime-tunable capacities, mirroring the original sources' fixed
//! `ARGSTACK_SIZE`/`REGSTACK_SIZE`/`INTSTACK_SIZE`/arena-block constants as
//! `VmConfig` fields instead of compile-time constants.

#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub reg_stack_capacity: usize,
    pub arg_stack_capacity: usize,
    pub int_stack_capacity: usize,
    pub gc_block: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            reg_stack_capacity: 1024,
            arg_stack_capacity: 4096,
            int_stack_capacity: 1024,
            gc_block: 4096,
        }
    }
}
