//! Architecture Glue
//!
//! CPU feature queries, the halt loop, and the final jump into the
//! kernel. Everything else architecture-specific (real-mode thunks, the
//! protected-mode descriptor dance for 32-bit handover) lives with the
//! platform entry stubs.

/// CPU capabilities the load pipeline branches on.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    pub long_mode: bool,
    pub huge_pages: bool,
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl CpuFeatures {
    /// Query CPUID for what this processor can do.
    pub fn detect() -> Self {
        // SAFETY: cpuid is unprivileged and always present in long mode.
        let extended = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
        Self {
            long_mode: extended.edx & (1 << 29) != 0,
            // 2 MiB pages are architectural once paging is on.
            huge_pages: true,
        }
    }
}

/// Stop forever. Interrupts are disabled first where the architecture
/// allows it.
pub fn halt() -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    loop {
        // SAFETY: cli/hlt have no requirements beyond ring 0.
        unsafe { core::arch::asm!("cli", "hlt") };
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod jump {
    use crate::handover::Handover;
    use crate::elf::Bitness;

    extern "C" {
        /// Platform stub: drops to protected mode and performs the far
        /// jump with the prepared stack.
        fn hyper_kernel_handover32(entrypoint: u32, stack_pointer: u32) -> !;
    }

    /// Load the prepared page table and jump to a 64-bit kernel with the
    /// attribute array address and magic in the argument registers.
    ///
    /// # Safety
    /// Never returns. The page table, stack and entrypoint must all be
    /// valid under the mappings being installed, and firmware services
    /// must already be exited.
    pub unsafe fn kernel_handover64(
        entrypoint: u64,
        stack: u64,
        page_table_root: u64,
        arg0: u64,
        arg1: u64,
    ) -> ! {
        // SAFETY: final step of the loader, per the contract above.
        unsafe {
            core::arch::asm!(
                "cli",
                "mov cr3, {pt}",
                "mov rsp, {stack}",
                "xor rbp, rbp",
                "jmp {entry}",
                pt = in(reg) page_table_root,
                stack = in(reg) stack,
                entry = in(reg) entrypoint,
                in("rdi") arg0,
                in("rsi") arg1,
                options(noreturn),
            )
        }
    }

    /// Marshal the kernel arguments onto the stack cdecl-style and hand
    /// off through the 32-bit platform stub.
    ///
    /// # Safety
    /// Never returns. The stack must be identity-accessible and the
    /// entrypoint a valid 32-bit kernel entry.
    pub unsafe fn kernel_handover32(entrypoint: u32, stack_top: u32, arg0: u32, arg1: u32) -> ! {
        let mut esp = stack_top;

        let mut push = |value: u32| {
            esp -= 4;
            // SAFETY: the stack region was allocated for the kernel and
            // is identity-accessible.
            unsafe { (esp as *mut u32).write(value) };
        };

        // Keep the stack 16-byte aligned at the entry boundary.
        push(0);
        push(0);
        push(arg1);
        push(arg0);

        // SAFETY: stub never returns.
        unsafe { hyper_kernel_handover32(entrypoint, esp) }
    }

    /// Perform the architecture-specific jump for a prepared handover.
    ///
    /// # Safety
    /// See the per-bitness primitives. Must only be called after
    /// firmware services were exited successfully.
    pub unsafe fn enter(handover: &Handover) -> ! {
        match handover.bitness {
            // SAFETY: forwarded contract.
            Bitness::B32 => unsafe {
                kernel_handover32(
                    handover.entrypoint as u32,
                    handover.stack_address as u32,
                    handover.attribute_array_address as u32,
                    handover.magic,
                )
            },
            // SAFETY: forwarded contract.
            Bitness::B64 => unsafe {
                kernel_handover64(
                    handover.entrypoint,
                    handover.stack_address,
                    handover.page_table_root,
                    handover.attribute_array_address,
                    handover.magic as u64,
                )
            },
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use jump::{enter, kernel_handover32, kernel_handover64};
