//! 32-bit Multiboot2 entry and the climb into long mode.
//!
//! The bootloader drops us in protected mode with paging off, the magic
//! in EAX and the info pointer in EBX. This stub builds a throwaway
//! paging hierarchy (identity for the low 4 GiB with 2 MiB pages, plus
//! the same physical gigabyte aliased at the kernel's high link
//! address), enables long mode, and calls `kernel_main`. The VMM
//! rebuilds paging properly later; these tables only have to survive
//! early boot.

#![cfg(all(target_arch = "x86_64", target_os = "none"))]

core::arch::global_asm!(
    r#"
    .section .boot, "ax"
    .code32
    .global _start32
_start32:
    cli
    mov esp, offset boot_stack_low_top
    mov dword ptr [mb_info_ptr], ebx
    mov dword ptr [mb_magic], eax

    // Zero all bootstrap tables in one sweep.
    mov edi, offset boot_pml4
    xor eax, eax
    mov ecx, 7 * 4096 / 4
    rep stosd

    // PML4: identity at slot 0, kernel high half at slot 511.
    mov eax, offset boot_pdp_low
    or eax, 0x3
    mov [boot_pml4], eax
    mov eax, offset boot_pdp_high
    or eax, 0x3
    mov [boot_pml4 + 511 * 8], eax

    // PDP low: four PDs cover 4 GiB. PDP high slot 510 reuses PD0 so
    // 0xFFFFFFFF80000000 aliases physical 0.
    mov eax, offset boot_pd0
    or eax, 0x3
    mov [boot_pdp_low], eax
    mov [boot_pdp_high + 510 * 8], eax
    mov eax, offset boot_pd1
    or eax, 0x3
    mov [boot_pdp_low + 8], eax
    mov eax, offset boot_pd2
    or eax, 0x3
    mov [boot_pdp_low + 16], eax
    mov eax, offset boot_pd3
    or eax, 0x3
    mov [boot_pdp_low + 24], eax

    // Fill the PDs with 2 MiB present+writable entries.
    mov edi, offset boot_pd0
    mov eax, 0x83
    mov ecx, 512 * 4
1:
    mov [edi], eax
    mov dword ptr [edi + 4], 0
    add eax, 0x200000
    add edi, 8
    loop 1b

    // PAE on, CR3 loaded, EFER.LME, then paging.
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax
    mov eax, offset boot_pml4
    mov cr3, eax
    mov ecx, 0xC0000080
    rdmsr
    or eax, 1 << 8
    wrmsr
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax

    lgdt [boot_gdt_desc]
    push 0x08
    push offset _start64
    retf

    .code64
_start64:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov fs, ax
    mov gs, ax

    movabs rsp, offset boot_stack_top
    xor ebp, ebp
    mov edi, dword ptr [mb_info_ptr]
    mov esi, dword ptr [mb_magic]
    movabs rax, offset kernel_main
    call rax
2:
    cli
    hlt
    jmp 2b

    // Bootstrap paging structures and scratch state, all low-linked.
    .align 4096
boot_pml4:      .skip 4096
boot_pdp_low:   .skip 4096
boot_pdp_high:  .skip 4096
boot_pd0:       .skip 4096
boot_pd1:       .skip 4096
boot_pd2:       .skip 4096
boot_pd3:       .skip 4096
mb_info_ptr:    .long 0
mb_magic:       .long 0
    .align 64
    .skip 512
boot_stack_low_top:

    .align 16
boot_gdt:
    .quad 0
    .quad 0x00AF9A000000FFFF
    .quad 0x00CF92000000FFFF
boot_gdt_desc:
    .word boot_gdt_desc - boot_gdt - 1
    .long boot_gdt

    // The real boot stack, linked (and used) in the high half.
    .section .bss
    .align 16
boot_stack:
    .skip 64 * 1024
boot_stack_top:
"#
);
