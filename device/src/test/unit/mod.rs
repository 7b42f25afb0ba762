mod allocator;
mod queue;
mod registry;
