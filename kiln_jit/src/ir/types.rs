//! Type descriptors and the type manager.
//!
//! Types are interned: structurally equal descriptors share one [`TypeId`],
//! so type equality is ID equality. The manager also owns the class
//! hierarchy and the field and method descriptors that instructions refer
//! to. Passes only query it; the vectorizer additionally asks it for vector
//! types.

use super::arena::{Arena, Id};
use rustc_hash::FxHashMap;

pub type TypeId = Id<TypeDesc>;
pub type ClassId = Id<ClassDesc>;
pub type FieldId = Id<FieldDesc>;
pub type MethodId = Id<MethodDesc>;

// =============================================================================
// Descriptors
// =============================================================================

/// Kind of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Boolean,
    Char,
    Int8,
    Int16,
    Int32,
    Int64,
    IntPtr,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Single,
    Double,
    /// Proof token. Carries no runtime value.
    Tau,
    /// Type of the null constant.
    NullObject,
    Object,
    Array,
    CompressedNull,
    CompressedObject,
    CompressedArray,
    /// Interior pointer into a heap object.
    ManagedPtr,
    UnmanagedPtr,
    VTablePtr,
    Vector,
}

impl TypeKind {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            TypeKind::Boolean
                | TypeKind::Char
                | TypeKind::Int8
                | TypeKind::Int16
                | TypeKind::Int32
                | TypeKind::Int64
                | TypeKind::IntPtr
                | TypeKind::UInt8
                | TypeKind::UInt16
                | TypeKind::UInt32
                | TypeKind::UInt64
        )
    }

    pub fn is_floating(self) -> bool {
        matches!(self, TypeKind::Single | TypeKind::Double)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            TypeKind::Boolean
                | TypeKind::Char
                | TypeKind::UInt8
                | TypeKind::UInt16
                | TypeKind::UInt32
                | TypeKind::UInt64
        )
    }

    /// Object-typed, compressed or not, including null.
    pub fn is_object(self) -> bool {
        matches!(
            self,
            TypeKind::NullObject
                | TypeKind::Object
                | TypeKind::Array
                | TypeKind::CompressedNull
                | TypeKind::CompressedObject
                | TypeKind::CompressedArray
        )
    }

    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            TypeKind::CompressedNull | TypeKind::CompressedObject | TypeKind::CompressedArray
        )
    }

    /// Width in bits of a scalar value of this kind.
    pub fn bit_width(self) -> Option<u32> {
        Some(match self {
            TypeKind::Boolean | TypeKind::Int8 | TypeKind::UInt8 => 8,
            TypeKind::Char | TypeKind::Int16 | TypeKind::UInt16 => 16,
            TypeKind::Int32 | TypeKind::UInt32 | TypeKind::Single => 32,
            TypeKind::Int64 | TypeKind::UInt64 | TypeKind::Double => 64,
            TypeKind::IntPtr
            | TypeKind::ManagedPtr
            | TypeKind::UnmanagedPtr
            | TypeKind::VTablePtr
            | TypeKind::NullObject
            | TypeKind::Object
            | TypeKind::Array => 64,
            TypeKind::CompressedNull | TypeKind::CompressedObject | TypeKind::CompressedArray => 32,
            _ => return None,
        })
    }
}

/// An interned type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeDesc {
    pub kind: TypeKind,
    /// Class of object types.
    pub class: Option<ClassId>,
    /// Element of arrays and vectors, pointee of pointers.
    pub element: Option<TypeId>,
    /// Lane count of vectors.
    pub lanes: u8,
}

impl TypeDesc {
    const fn simple(kind: TypeKind) -> Self {
        TypeDesc {
            kind,
            class: None,
            element: None,
            lanes: 0,
        }
    }
}

/// A class in the hierarchy.
#[derive(Debug, Clone)]
pub struct ClassDesc {
    pub name: String,
    pub super_class: Option<ClassId>,
    pub is_final: bool,
    /// Unresolved classes have not been loaded by the VM yet.
    pub resolved: bool,
}

/// A field of a class.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: String,
    pub owner: ClassId,
    pub ty: TypeId,
    /// Byte offset inside the object, or inside the static area.
    pub offset: u32,
    pub is_static: bool,
}

/// A callable method.
#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub name: String,
    pub owner: Option<ClassId>,
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    pub is_static: bool,
}

// =============================================================================
// Type Manager
// =============================================================================

/// Interning table for types plus the class, field and method tables.
#[derive(Debug, Clone)]
pub struct TypeManager {
    types: Arena<TypeDesc>,
    interned: FxHashMap<TypeDesc, TypeId>,
    classes: Arena<ClassDesc>,
    fields: Arena<FieldDesc>,
    methods: Arena<MethodDesc>,
    root_class: ClassId,
    root: TypeId,
}

impl TypeManager {
    /// Create a manager with the primitive types and a root object class.
    pub fn new() -> Self {
        let mut tm = TypeManager {
            types: Arena::new(),
            interned: FxHashMap::default(),
            classes: Arena::new(),
            fields: Arena::new(),
            methods: Arena::new(),
            root_class: ClassId::INVALID,
            root: TypeId::INVALID,
        };
        for kind in [
            TypeKind::Void,
            TypeKind::Boolean,
            TypeKind::Char,
            TypeKind::Int8,
            TypeKind::Int16,
            TypeKind::Int32,
            TypeKind::Int64,
            TypeKind::IntPtr,
            TypeKind::UInt8,
            TypeKind::UInt16,
            TypeKind::UInt32,
            TypeKind::UInt64,
            TypeKind::Single,
            TypeKind::Double,
            TypeKind::Tau,
            TypeKind::NullObject,
            TypeKind::CompressedNull,
        ] {
            tm.intern(TypeDesc::simple(kind));
        }
        tm.root_class = tm.classes.alloc(ClassDesc {
            name: "Object".into(),
            super_class: None,
            is_final: false,
            resolved: true,
        });
        tm.root = tm.object_type(tm.root_class);
        tm
    }

    fn intern(&mut self, desc: TypeDesc) -> TypeId {
        if let Some(&id) = self.interned.get(&desc) {
            return id;
        }
        let id = self.types.alloc(desc);
        self.interned.insert(desc, id);
        id
    }

    fn prim(&self, kind: TypeKind) -> TypeId {
        // Primitives are interned first, in declaration order.
        self.interned
            .get(&TypeDesc::simple(kind))
            .copied()
            .unwrap_or(TypeId::INVALID)
    }

    pub fn void(&self) -> TypeId {
        self.prim(TypeKind::Void)
    }
    pub fn boolean(&self) -> TypeId {
        self.prim(TypeKind::Boolean)
    }
    pub fn char(&self) -> TypeId {
        self.prim(TypeKind::Char)
    }
    pub fn int8(&self) -> TypeId {
        self.prim(TypeKind::Int8)
    }
    pub fn int16(&self) -> TypeId {
        self.prim(TypeKind::Int16)
    }
    pub fn int32(&self) -> TypeId {
        self.prim(TypeKind::Int32)
    }
    pub fn int64(&self) -> TypeId {
        self.prim(TypeKind::Int64)
    }
    pub fn int_ptr(&self) -> TypeId {
        self.prim(TypeKind::IntPtr)
    }
    pub fn uint32(&self) -> TypeId {
        self.prim(TypeKind::UInt32)
    }
    pub fn uint64(&self) -> TypeId {
        self.prim(TypeKind::UInt64)
    }
    pub fn single(&self) -> TypeId {
        self.prim(TypeKind::Single)
    }
    pub fn double(&self) -> TypeId {
        self.prim(TypeKind::Double)
    }
    pub fn tau(&self) -> TypeId {
        self.prim(TypeKind::Tau)
    }
    pub fn null_object(&self) -> TypeId {
        self.prim(TypeKind::NullObject)
    }

    /// The root of the class hierarchy.
    pub fn root_class(&self) -> ClassId {
        self.root_class
    }

    /// Object type of the root class.
    pub fn root_object(&self) -> TypeId {
        self.root
    }

    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Declare a class. `None` as super class means the root class.
    pub fn define_class(&mut self, name: &str, super_class: Option<ClassId>, is_final: bool) -> ClassId {
        self.classes.alloc(ClassDesc {
            name: name.to_string(),
            super_class: Some(super_class.unwrap_or(self.root_class)),
            is_final,
            resolved: true,
        })
    }

    /// Declare a class the VM has not loaded yet.
    pub fn define_unresolved_class(&mut self, name: &str) -> ClassId {
        self.classes.alloc(ClassDesc {
            name: name.to_string(),
            super_class: Some(self.root_class),
            is_final: false,
            resolved: false,
        })
    }

    pub fn object_type(&mut self, class: ClassId) -> TypeId {
        self.intern(TypeDesc {
            kind: TypeKind::Object,
            class: Some(class),
            element: None,
            lanes: 0,
        })
    }

    pub fn array_of(&mut self, element: TypeId) -> TypeId {
        self.intern(TypeDesc {
            kind: TypeKind::Array,
            class: None,
            element: Some(element),
            lanes: 0,
        })
    }

    pub fn managed_ptr(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeDesc {
            kind: TypeKind::ManagedPtr,
            class: None,
            element: Some(pointee),
            lanes: 0,
        })
    }

    pub fn vtable_ptr(&mut self, object: TypeId) -> TypeId {
        self.intern(TypeDesc {
            kind: TypeKind::VTablePtr,
            class: None,
            element: Some(object),
            lanes: 0,
        })
    }

    /// Vector of `lanes` elements of a scalar numeric type.
    pub fn vector(&mut self, element: TypeId, lanes: u8) -> TypeId {
        self.intern(TypeDesc {
            kind: TypeKind::Vector,
            class: None,
            element: Some(element),
            lanes,
        })
    }

    /// Compressed form of an object type. Other types map to themselves.
    pub fn compressed(&mut self, ty: TypeId) -> TypeId {
        let desc = self.types[ty];
        let kind = match desc.kind {
            TypeKind::NullObject => TypeKind::CompressedNull,
            TypeKind::Object => TypeKind::CompressedObject,
            TypeKind::Array => TypeKind::CompressedArray,
            _ => return ty,
        };
        self.intern(TypeDesc { kind, ..desc })
    }

    /// Uncompressed form of an object type. Other types map to themselves.
    pub fn uncompressed(&mut self, ty: TypeId) -> TypeId {
        let desc = self.types[ty];
        let kind = match desc.kind {
            TypeKind::CompressedNull => TypeKind::NullObject,
            TypeKind::CompressedObject => TypeKind::Object,
            TypeKind::CompressedArray => TypeKind::Array,
            _ => return ty,
        };
        self.intern(TypeDesc { kind, ..desc })
    }

    pub fn define_field(&mut self, owner: ClassId, name: &str, ty: TypeId, offset: u32, is_static: bool) -> FieldId {
        self.fields.alloc(FieldDesc {
            name: name.to_string(),
            owner,
            ty,
            offset,
            is_static,
        })
    }

    pub fn define_method(
        &mut self,
        name: &str,
        owner: Option<ClassId>,
        params: Vec<TypeId>,
        ret: TypeId,
        is_static: bool,
    ) -> MethodId {
        self.methods.alloc(MethodDesc {
            name: name.to_string(),
            owner,
            params,
            ret,
            is_static,
        })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    #[inline]
    pub fn desc(&self, ty: TypeId) -> &TypeDesc {
        &self.types[ty]
    }

    #[inline]
    pub fn kind(&self, ty: TypeId) -> TypeKind {
        self.types[ty].kind
    }

    pub fn class(&self, id: ClassId) -> &ClassDesc {
        &self.classes[id]
    }

    pub fn field(&self, id: FieldId) -> &FieldDesc {
        &self.fields[id]
    }

    pub fn method(&self, id: MethodId) -> &MethodDesc {
        &self.methods[id]
    }

    pub fn is_array(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Array | TypeKind::CompressedArray)
    }

    pub fn is_vector(&self, ty: TypeId) -> bool {
        self.kind(ty) == TypeKind::Vector
    }

    pub fn is_object(&self, ty: TypeId) -> bool {
        self.kind(ty).is_object()
    }

    pub fn is_integer(&self, ty: TypeId) -> bool {
        self.kind(ty).is_integer()
    }

    pub fn is_floating(&self, ty: TypeId) -> bool {
        self.kind(ty).is_floating()
    }

    pub fn is_managed_pointer(&self, ty: TypeId) -> bool {
        self.kind(ty) == TypeKind::ManagedPtr
    }

    /// Element type of an array or vector.
    pub fn element_type(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Array | TypeKind::CompressedArray | TypeKind::Vector => self.types[ty].element,
            _ => None,
        }
    }

    /// Pointee of a managed or unmanaged pointer.
    pub fn pointed_to_type(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::ManagedPtr | TypeKind::UnmanagedPtr | TypeKind::VTablePtr => self.types[ty].element,
            _ => None,
        }
    }

    pub fn lanes(&self, ty: TypeId) -> u32 {
        self.types[ty].lanes as u32
    }

    pub fn bit_width(&self, ty: TypeId) -> Option<u32> {
        self.kind(ty).bit_width()
    }

    /// A type is resolved unless it names a class the VM has not loaded.
    pub fn is_resolved(&self, ty: TypeId) -> bool {
        let desc = &self.types[ty];
        match (desc.class, desc.element) {
            (Some(c), _) => self.classes[c].resolved,
            (None, Some(e)) if desc.kind != TypeKind::Vector => self.is_resolved(e),
            _ => true,
        }
    }

    fn class_extends(&self, mut class: ClassId, ancestor: ClassId) -> bool {
        loop {
            if class == ancestor {
                return true;
            }
            match self.classes[class].super_class {
                Some(s) => class = s,
                None => return false,
            }
        }
    }

    /// Subtype relation over object types, following the class hierarchy.
    ///
    /// Compressed types relate only to compressed types.
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        if sub == sup {
            return true;
        }
        let a = &self.types[sub];
        let b = &self.types[sup];
        if !a.kind.is_object() || !b.kind.is_object() || a.kind.is_compressed() != b.kind.is_compressed() {
            return false;
        }
        use TypeKind::*;
        match (a.kind, b.kind) {
            (NullObject | CompressedNull, _) => true,
            (_, NullObject | CompressedNull) => false,
            (Object | CompressedObject, Object | CompressedObject) => match (a.class, b.class) {
                (Some(ca), Some(cb)) => self.class_extends(ca, cb),
                _ => false,
            },
            (Array | CompressedArray, Object | CompressedObject) => b.class == Some(self.root_class),
            (Array | CompressedArray, Array | CompressedArray) => match (a.element, b.element) {
                (Some(ea), Some(eb)) => ea == eb || self.is_subtype(ea, eb),
                _ => false,
            },
            _ => false,
        }
    }

    /// Printable name, for dumps and diagnostics.
    pub fn name(&self, ty: TypeId) -> String {
        let desc = &self.types[ty];
        let elem = |e: Option<TypeId>| e.map(|e| self.name(e)).unwrap_or_else(|| "?".into());
        match desc.kind {
            TypeKind::Object | TypeKind::CompressedObject => {
                let class = desc.class.map(|c| self.classes[c].name.clone()).unwrap_or_default();
                if desc.kind.is_compressed() {
                    format!("cmpref<{class}>")
                } else {
                    class
                }
            }
            TypeKind::Array => format!("{}[]", elem(desc.element)),
            TypeKind::CompressedArray => format!("cmpref<{}[]>", elem(desc.element)),
            TypeKind::ManagedPtr => format!("&{}", elem(desc.element)),
            TypeKind::VTablePtr => format!("vtable<{}>", elem(desc.element)),
            TypeKind::Vector => format!("<{} x {}>", desc.lanes, elem(desc.element)),
            kind => format!("{kind:?}").to_lowercase(),
        }
    }
}

impl Default for TypeManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning() {
        let mut tm = TypeManager::new();
        let i32_ = tm.int32();
        let a = tm.array_of(i32_);
        let b = tm.array_of(i32_);
        assert_eq!(a, b);
        assert_ne!(tm.int32(), tm.int64());
        assert_eq!(tm.element_type(a), Some(i32_));
        let v = tm.vector(i32_, 4);
        assert!(tm.is_vector(v));
        assert_eq!(tm.lanes(v), 4);
        assert_eq!(tm.name(v), "<4 x int32>");
    }

    #[test]
    fn test_subclass_relation() {
        let mut tm = TypeManager::new();
        let animal = tm.define_class("Animal", None, false);
        let dog = tm.define_class("Dog", Some(animal), true);
        let animal_t = tm.object_type(animal);
        let dog_t = tm.object_type(dog);
        assert!(tm.is_subtype(dog_t, animal_t));
        assert!(!tm.is_subtype(animal_t, dog_t));
        assert!(tm.is_subtype(dog_t, tm.root_object()));
        assert!(tm.is_subtype(tm.null_object(), dog_t));

        let dogs = tm.array_of(dog_t);
        let animals = tm.array_of(animal_t);
        assert!(tm.is_subtype(dogs, animals));
        assert!(tm.is_subtype(dogs, tm.root_object()));
    }

    #[test]
    fn test_compressed_forms() {
        let mut tm = TypeManager::new();
        let c = tm.define_class("Point", None, false);
        let t = tm.object_type(c);
        let ct = tm.compressed(t);
        assert_eq!(tm.kind(ct), TypeKind::CompressedObject);
        assert_eq!(tm.uncompressed(ct), t);
        let root_c = tm.compressed(tm.root_object());
        assert!(tm.is_subtype(ct, root_c));
        assert!(!tm.is_subtype(ct, tm.root_object()));
    }

    #[test]
    fn test_resolution() {
        let mut tm = TypeManager::new();
        let u = tm.define_unresolved_class("Lazy");
        let t = tm.object_type(u);
        let arr = tm.array_of(t);
        assert!(!tm.is_resolved(arr));
        assert!(tm.is_resolved(tm.int32()));
    }
}
