use crate::memory::AddrSpace;

/// Element types understood by the typed-data printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Ptr,
    Vector { elem: Box<Type>, count: u32 },
}

impl Type {
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Type::I8 | Type::U8 => 1,
            Type::I16 | Type::U16 => 2,
            Type::I32 | Type::U32 | Type::F32 => 4,
            Type::I64 | Type::U64 | Type::F64 | Type::Ptr => 8,
            Type::Vector { elem, count } => elem.size() * u64::from(*count),
        }
    }
}

/// Render raw little-endian bytes according to their type.
#[must_use]
pub fn print_typed_data(ty: &Type, data: &[u8]) -> String {
    if (data.len() as u64) < ty.size() {
        return "<invalid>".to_string();
    }
    match ty {
        Type::I8 => i8::from_le_bytes([data[0]]).to_string(),
        Type::U8 => data[0].to_string(),
        Type::I16 => i16::from_le_bytes([data[0], data[1]]).to_string(),
        Type::U16 => u16::from_le_bytes([data[0], data[1]]).to_string(),
        Type::I32 => i32::from_le_bytes(data[..4].try_into().unwrap()).to_string(),
        Type::U32 => u32::from_le_bytes(data[..4].try_into().unwrap()).to_string(),
        Type::I64 => i64::from_le_bytes(data[..8].try_into().unwrap()).to_string(),
        Type::U64 => u64::from_le_bytes(data[..8].try_into().unwrap()).to_string(),
        Type::F32 => f32::from_le_bytes(data[..4].try_into().unwrap()).to_string(),
        Type::F64 => f64::from_le_bytes(data[..8].try_into().unwrap()).to_string(),
        Type::Ptr => format!("0x{:x}", u64::from_le_bytes(data[..8].try_into().unwrap())),
        Type::Vector { elem, count } => {
            let elem_size = elem.size() as usize;
            (0..*count as usize)
                .map(|i| print_typed_data(elem, &data[i * elem_size..]))
                .collect::<Vec<_>>()
                .join(",")
        }
    }
}

/// A pointer-typed value, enough to resolve subscripted reads.
///
/// For stack allocations the address is indirect: it names the private-memory
/// slot holding the actual base pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct Pointer {
    pub space: AddrSpace,
    pub address: u64,
    pub elem: Type,
    pub indirect: bool,
}

/// A variable as exposed by the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Scalar { ty: Type, data: Vec<u8> },
    Pointer(Pointer),
}

impl std::fmt::Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Variable::Scalar { ty, data } => write!(f, "{}", print_typed_data(ty, data)),
            Variable::Pointer(pointer) => write!(f, "0x{:x}", pointer.address),
        }
    }
}
