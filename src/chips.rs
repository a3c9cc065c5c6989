//! Known STM32 product IDs as reported by `GetId`.

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Chip {
    pub id: u16,
    pub name: &'static str,
    /// Flash page size, for families with uniform pages
    pub page_size: Option<u32>,
}

const fn chip(id: u16, name: &'static str, page_size: Option<u32>) -> Chip {
    Chip { id, name, page_size }
}

const K1: Option<u32> = Some(1024);
const K2: Option<u32> = Some(2048);

pub const CHIPS: &[Chip] = &[
    chip(0x410, "STM32F1 Medium-density", K1),
    chip(0x411, "STM32F2xx", None),
    chip(0x412, "STM32F1 Low-density", K1),
    chip(0x413, "STM32F405/407/415/417", None),
    chip(0x414, "STM32F1 High-density", K2),
    chip(0x415, "STM32L4x1/L4x5/L4x6", K2),
    chip(0x416, "STM32L1 Medium-density", Some(256)),
    chip(0x417, "STM32L0 Cat.3", Some(128)),
    chip(0x418, "STM32F1 Connectivity line", K2),
    chip(0x419, "STM32F42x/F43x", None),
    chip(0x420, "STM32F1 Medium-density VL", K1),
    chip(0x421, "STM32F446", None),
    chip(0x422, "STM32F302xB/C/303xB/C/358", K2),
    chip(0x423, "STM32F401xB/C", None),
    chip(0x425, "STM32L0 Cat.2", Some(128)),
    chip(0x427, "STM32L1 Medium-density Plus", Some(256)),
    chip(0x428, "STM32F1 High-density VL", K2),
    chip(0x429, "STM32L1 Cat.2", Some(256)),
    chip(0x430, "STM32F1 XL-density", K2),
    chip(0x431, "STM32F411", None),
    chip(0x432, "STM32F37x", K2),
    chip(0x433, "STM32F401xD/E", None),
    chip(0x434, "STM32F469/479", None),
    chip(0x435, "STM32L4x2", K2),
    chip(0x436, "STM32L1 High-density", Some(256)),
    chip(0x437, "STM32L1 Medium-density Plus", Some(256)),
    chip(0x438, "STM32F334", K2),
    chip(0x439, "STM32F302x6/8/303x6/8/328", K2),
    chip(0x440, "STM32F05x", K1),
    chip(0x441, "STM32F412", None),
    chip(0x442, "STM32F030x8", K2),
    chip(0x444, "STM32F03x", K1),
    chip(0x445, "STM32F04x", K1),
    chip(0x446, "STM32F303xD/E/398", K2),
    chip(0x447, "STM32L0 Cat.5", Some(128)),
    chip(0x448, "STM32F07x", K2),
    chip(0x449, "STM32F74x/F75x", None),
    chip(0x450, "STM32H7xx", None),
    chip(0x451, "STM32F76x/F77x", None),
    chip(0x452, "STM32F72x/F73x", None),
    chip(0x457, "STM32L0 Cat.1", Some(128)),
    chip(0x458, "STM32F410", None),
    chip(0x460, "STM32G0x0", K2),
    chip(0x461, "STM32L496/4A6", K2),
    chip(0x462, "STM32L45x/L46x", K2),
    chip(0x463, "STM32F413/423", None),
    chip(0x464, "STM32L4R/S", None),
    chip(0x466, "STM32G0x1", K2),
    chip(0x467, "STM32G0Bx/G0Cx", K2),
    chip(0x468, "STM32G4x1", K2),
    chip(0x469, "STM32G4x3", None),
    chip(0x470, "STM32L4P5/L4Q5", None),
    chip(0x471, "STM32L4R5/L4R7/L4R9/L4S5/L4S7/L4S9", None),
    chip(0x472, "STM32L5x2", None),
    chip(0x479, "STM32G4x4", K2),
    chip(0x480, "STM32H7Ax/H7Bx", None),
    chip(0x482, "STM32U575/U585", None),
    chip(0x483, "STM32H72x/H73x", None),
    chip(0x495, "STM32WBx5", Some(4096)),
    chip(0x496, "STM32WBx0", Some(4096)),
    chip(0x497, "STM32WLEx", K2),
];

pub fn lookup(id: u16) -> Option<&'static Chip> {
    CHIPS.iter().find(|c| c.id == id)
}
