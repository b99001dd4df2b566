pub mod ppo;
