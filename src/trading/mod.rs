mod orders;

pub use orders::{
    gen_client_order_id, CreateOrderResponse, Order, OrderPlan, OrderStatus, OrderType, Side,
    TimeInForce,
};
