//! Guest call context
//!
//! The register state a recompiled function sees. The substrate itself
//! only reads LR/CTR for diagnostics and writes r3 on fallback; the rest
//! belongs to the callee.

/// Guest register file visible at an indirect call site
#[derive(Debug, Clone)]
pub struct CallContext {
    /// General purpose registers
    pub gpr: [u64; 32],
    /// Link register (return address of the call site)
    pub lr: u64,
    /// Count register (usual source of the indirect target)
    pub ctr: u64,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            lr: 0,
            ctr: 0,
        }
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// r3, the integer result register
    #[inline]
    pub fn r3(&self) -> u64 {
        self.gpr[3]
    }

    /// Set r3; the fallback paths use this to fake a zero return
    #[inline]
    pub fn set_r3(&mut self, value: u64) {
        self.gpr[3] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_r3_accessors() {
        let mut ctx = CallContext::new();
        assert_eq!(ctx.r3(), 0);
        ctx.set_r3(0xCAFE);
        assert_eq!(ctx.r3(), 0xCAFE);
        assert_eq!(ctx.gpr[3], 0xCAFE);
    }
}
