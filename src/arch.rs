//! Architecture constants and decode-mode selection

/// true if compiling for 64-bit
#[cfg(target_arch = "x86_64")]
pub const IS_64BIT: bool = true;

/// true if compiling for 64-bit
#[cfg(not(target_arch = "x86_64"))]
pub const IS_64BIT: bool = false;

/// pointer size in bytes for current architecture
pub const PTR_SIZE: usize = core::mem::size_of::<usize>();

/// decoder bitness for the compilation target
pub const fn native_bitness() -> u32 {
    if IS_64BIT {
        64
    } else {
        32
    }
}
