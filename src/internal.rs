pub mod block_list;
