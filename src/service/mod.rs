//! 服务层
//!
//! 属性字典、服务对象、服务引用/注册凭证以及服务注册表。

pub mod object;
pub mod properties;
pub mod reference;
pub mod registry;

pub use object::ServiceObject;
pub use properties::{PropertyDictionary, Value, OBJECT_CLASS, SERVICE_ID, SERVICE_RANKING};
pub use reference::{ServiceReference, ServiceRegistration};
pub use registry::{RegistrationState, ServiceRegistry};
